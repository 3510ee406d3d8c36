#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extract;
pub mod merge;
pub mod progress;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod stream;
pub mod types;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../genes/mod.rs"]
pub mod genes;
