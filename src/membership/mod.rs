//! HyParView-style partial-view membership.

pub mod handler;
pub mod manager;
pub mod persist;
pub mod view;

pub use handler::{Action, Handler};
pub use manager::{start, ManagerConfig, ManagerHandle, ManagerMsg};
pub use persist::{PersistError, SnapshotStore};
pub use view::{PendingKind, Views};
