//! Lifecycle of sandbox chain nodes: launching, persisting, expiring and
//! destroying them.

pub mod launcher;
pub mod manager;
pub mod node_handle;
pub mod port_alloc;
mod reaper;
pub mod store;

pub use launcher::{AnvilConfig, AnvilLauncher, LaunchError, LaunchedNode, NodeLauncher};
pub use manager::{DestroyCause, InstanceError, InstanceManager};
pub use node_handle::{ChildNode, NodeHandle};
pub use store::{FileStore, InstanceStore, MemoryStore, StoreError};
