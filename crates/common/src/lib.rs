//! Shared types, errors and persistence for the PVE console gateway.

pub mod db;
pub mod error;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use types::{ConsoleSessionBundle, PveServer, VirtualMachine, VmStatus};
