#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(missing_docs)]

mod config;
mod connection;
mod errors;
mod manager;
mod util;

pub use easybase_pool as pool;
pub use easybase_pool::{Error as PoolError, PoolState, PooledConnection};

pub use self::{
    config::*,
    connection::{Connection, ConnectionConfig, Stream, TcpConfig, TcpKeepaliveConfig},
    errors::*,
    manager::{ConnectionManager, ConnectionPool},
};
