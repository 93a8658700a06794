//! Core library for the parallel ports builder
//!
//! This crate contains the dependency resolver, the BSD chroot worker
//! environment, the phase runner, the scheduler, the persistence store, and
//! the ambient concerns (config, logging, errors) shared by the CLI.

pub mod bootstrap;
pub mod config;
pub mod crc;
pub mod dependency;
pub mod errors;
pub mod logfiles;
pub mod logging;
pub mod metadata;
pub mod mount;
pub mod phase;
pub mod port;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;
pub mod worker_env;
pub mod worker_helper;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
