//! Server instances.
//!
//! - `controller`: one installation, its process, log tail and resources
//! - `registry`: every instance plus the persisted roster
//! - `cleanup`: cache and log housekeeping

mod cleanup;
mod controller;
mod registry;
mod types;

pub use controller::{InstanceController, InstanceDeps};
pub use registry::InstanceRegistry;
pub use types::{
    DirtyFlag, InstanceEvent, InstanceEventKind, InstanceStatus, RuntimeState, StartOutcome,
};
