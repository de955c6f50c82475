#![cfg_attr(test, allow(clippy::unwrap_used))]

mod export;
mod join_file;
mod mapping_set;
mod translate_manager;
mod watcher;

pub use join_file::JoinFileWatcher;
pub use translate_manager::{Direction, ProcessSpawner, Spawn, TranslateInvocation};
pub use watcher::{ClientConfig, Role, run};
