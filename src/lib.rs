pub mod cgroup;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod entity;
pub mod error;
pub mod init;
pub mod namespace;
pub mod network;
pub mod pivot_root;
pub mod rootfs;
pub mod rpc;
pub mod runtime;
pub mod store;
pub mod terminal;

// Re-export main types and functions for easier testing
pub use cgroup::CgroupManager;
pub use config::Config;
pub use error::{Error, Result};
pub use network::Networks;
pub use pivot_root::setup_rootfs;
pub use runtime::{LaunchSpec, Mode, launch};
