#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod checkout;
pub mod error;
mod manage;
mod metrics;
mod pool;
mod registry;
mod resource;

pub use crate::{
    error::Error,
    manage::{FnManager, ManageConnection},
    metrics::PoolState,
    pool::{Pool, PoolBuilder, DEFAULT_MAX_SIZE},
    resource::PooledConnection,
};
