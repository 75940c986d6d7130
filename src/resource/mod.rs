//! Resources shipped with an installation and the files that describe them.

mod catalog;
mod settings;
mod watch;

pub use catalog::{scan_resources, CatalogDiff, ResourceCatalog, ResourceMeta};
pub use settings::{ServerLogLevel, ServerSettings};
pub use watch::{is_relevant, spawn_watcher, ResourceWatch, WatchAction, WatchDebouncer};
