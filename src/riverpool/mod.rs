pub mod common;
pub mod config;
pub mod pg;
pub mod server;

pub use common::{Error, ErrorKind, Result};
