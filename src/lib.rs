//! Multichannel dispatch and reconciliation core.
//!
//! A piece of hub content fans out to delivery channels through per-channel
//! adapters; the bulk-messaging channel splits large recipient lists into
//! provider-side groups, tracks their asynchronous completion, reconciles
//! the reported counts into a durable aggregate, and can carve failed
//! recipients out into a new dispatch attempt.
//!
//! The operational surface for an API/UI layer: [`hub::HubSynchronizer`]
//! (`request_draft`, `mark_linked`, `mark_drafting`, `unlink`),
//! [`dispatch::Dispatcher::dispatch`], [`reconcile::Reconciler::sync`] /
//! [`reconcile::Reconciler::spawn_sync`], and [`retry::extract_failed`].

pub mod channels;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod locks;
pub mod model;
pub mod planner;
pub mod reconcile;
pub mod retry;
pub mod worker;

pub use dispatch::Dispatcher;
pub use hub::HubSynchronizer;
pub use reconcile::{Reconciler, SyncOptions, SyncReport};
pub use retry::extract_failed;
