pub mod audit;
pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod item;
pub mod paths;
pub mod reflection;
pub mod retry;
pub mod schedule;
pub mod types;
pub mod vault;

pub use error::{Result, VaultError};
