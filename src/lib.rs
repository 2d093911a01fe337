//! autoproxy - GFWList-driven proxy auto-config gateway.
//!
//! Downloads and parses a GFWList rule file, publishes it as a suffix-matched
//! domain set, and serves PAC scripts built from it.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod logging;
pub mod pac;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod store;
pub mod transport;
pub mod updater;

pub use error::{Error, Result};
