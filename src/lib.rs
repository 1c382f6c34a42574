//! Side chain ⇄ relay chain relayer
//!
//! Two monitors scan finalized blocks of each chain and queue the cross-chain
//! events they find, the commit scheduler submits the queued commits to the
//! peer chain, and the deposit reconciler re-queues anything the monitors
//! missed. All coordination goes through the SQLite checkpoint store.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod reconciler;
pub mod scheduler;
pub mod signer;
pub mod store;
pub mod types;
