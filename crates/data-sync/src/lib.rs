//! Offline-first document sync for the Tidesync SDK
//!
//! This crate hosts the sync coordinator gluing the networking, remote
//! client, and local storage layers together, along with connectivity
//! tracking and the remote operation listener surface.

#![warn(clippy::all)]

pub mod coordinator;
pub mod listener;
pub mod network;

pub use coordinator::{
    DataSyncCoordinator, SyncConfig, DEFAULT_API_URL, READONLY_PARTITION, USER_PARTITION,
};
pub use listener::RemoteOperationListener;
pub use network::NetworkWatcher;
