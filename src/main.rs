use std::future::Future;
use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relayer::api;
use relayer::chain::{
    ChainReader, ChainWriter, DepositSource, EpochSource, RelayChainClient, SideChainClient,
};
use relayer::config::Config;
use relayer::error::ConsistencyError;
use relayer::monitor::{ChainMonitor, MonitorConfig};
use relayer::reconciler::DepositReconciler;
use relayer::scheduler::{CommitScheduler, SchedulerSettings};
use relayer::signer::Signer;
use relayer::store::CheckpointStore;

fn main() -> Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_logging();

    info!("Starting side chain relayer");

    // Everything up to the first spawned loop is fatal on failure
    let config = Config::load()?;
    info!(
        side_chain_id = config.side.chain_id,
        side_rpc = %config.side.rpc_url,
        relay_rpc = %config.relay.rpc_url,
        db = %config.database.path,
        "Configuration loaded"
    );

    let store = CheckpointStore::open(&config.database.path).await?;

    let side_signer = Arc::new(
        Signer::unlock(&config.side.keystore_dir, &config.side.keystore_passwords)
            .wrap_err("Failed to unlock side chain accounts")?,
    );
    let relay_signer = Arc::new(
        Signer::unlock(&config.relay.keystore_dir, &config.relay.keystore_passwords)
            .wrap_err("Failed to unlock relay chain accounts")?,
    );

    let side = Arc::new(
        SideChainClient::connect(
            &config.side,
            side_signer.clone(),
            config.scheduler.retry(),
            config.scheduler.submit_timeout(),
        )
        .await?,
    );
    let relay = Arc::new(
        RelayChainClient::connect(
            &config.relay,
            config.side.chain_id,
            relay_signer.clone(),
            config.scheduler.submit_timeout(),
        )
        .await?
        .with_epoch_source(side.clone() as Arc<dyn EpochSource>),
    );
    let side_chain_id = config.side.chain_id;
    let relay_chain_id = ChainReader::chain_id(relay.as_ref());

    let mut scheduler = CommitScheduler::new(
        store.clone(),
        SchedulerSettings::from_config(&config.scheduler),
    );
    scheduler.add_route(side.clone() as Arc<dyn ChainWriter>, side_signer.accounts())?;
    scheduler.add_route(relay.clone() as Arc<dyn ChainWriter>, relay_signer.accounts())?;
    scheduler.ensure_route(side_chain_id)?;
    scheduler.ensure_route(relay_chain_id)?;

    let mut reconciler = DepositReconciler::new(store.clone(), &config.reconciler);
    reconciler.add_source(
        side_chain_id,
        side.clone() as Arc<dyn DepositSource>,
        relay_chain_id,
    );

    let side_monitor = ChainMonitor::new(
        side.clone(),
        store.clone(),
        relay_chain_id,
        MonitorConfig::side(&config),
    );
    let relay_monitor = ChainMonitor::new(
        relay.clone(),
        store.clone(),
        side_chain_id,
        MonitorConfig::relay(&config),
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    tasks.spawn(named("side-monitor", side_monitor.run(cancel.clone())));
    tasks.spawn(named("relay-monitor", relay_monitor.run(cancel.clone())));
    tasks.spawn(named("scheduler", scheduler.run(cancel.clone())));
    tasks.spawn(named("reconciler", reconciler.run(cancel.clone())));
    if let Some(addr) = config.api_addr {
        tasks.spawn(named("api", api::serve(addr, store.clone(), cancel.clone())));
    }

    info!(side_chain_id, relay_chain_id, "Relayer running");

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    // Set when the whole process has to stop with an error
    let mut failure: Option<eyre::Report> = None;
    // Last loop failure, reported if every loop ended on its own
    let mut last_task_error: Option<eyre::Report> = None;
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                match signal {
                    Ok(name) => info!(signal = name, "Shutdown signal received"),
                    Err(e) => failure = Some(e),
                }
                break;
            }
            joined = tasks.join_next() => match joined {
                None => {
                    error!("No task left running, shutting down");
                    failure = last_task_error.take();
                    break;
                }
                Some(Ok((task, Ok(())))) => {
                    warn!(task, "Task exited");
                }
                Some(Ok((task, Err(e)))) => {
                    if let Some(consistency) = ConsistencyError::find(&e) {
                        if config.halt_on_consistency_error {
                            error!(
                                task,
                                chain_id = consistency.chain_id(),
                                error = ?e,
                                "Consistency error, shutting down"
                            );
                            failure = Some(e);
                            break;
                        }
                        error!(
                            task,
                            chain_id = consistency.chain_id(),
                            error = %consistency,
                            "Consistency error, continuing without this task"
                        );
                    } else {
                        error!(task, error = ?e, "Task failed, continuing without it");
                    }
                    last_task_error = Some(e);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Task panicked, continuing without it");
                    last_task_error = Some(eyre!("task panicked: {}", e));
                }
            }
        }
    }

    // Stop taking new work, then let in-flight submissions settle
    cancel.cancel();
    let grace = config.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((task, Ok(()))) => info!(task, "Task stopped"),
                Ok((task, Err(e))) => warn!(task, error = %e, "Task stopped with error"),
                Err(e) => warn!(error = %e, "Task panicked during shutdown"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "Grace period elapsed, aborting remaining tasks");
        tasks.abort_all();
    }

    store.close().await;
    info!("Side chain relayer stopped");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn named<F>(task: &'static str, fut: F) -> (&'static str, Result<()>)
where
    F: Future<Output = Result<()>>,
{
    (task, fut.await)
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,relayer=debug,sidechain_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal;

    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let mut terminate =
            unix_signal(SignalKind::terminate()).wrap_err("Failed to install SIGTERM handler")?;
        let mut hangup =
            unix_signal(SignalKind::hangup()).wrap_err("Failed to install SIGHUP handler")?;

        tokio::select! {
            res = signal::ctrl_c() => {
                res.wrap_err("Failed to listen for Ctrl+C")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
            _ = hangup.recv() => Ok("SIGHUP"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        Ok("SIGINT")
    }
}
