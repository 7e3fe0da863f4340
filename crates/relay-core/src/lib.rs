//! Core contracts and pipeline for the channel relay.
//!
//! This crate is provider-agnostic. The chat provider's wire format and HTTP
//! client live in adapter crates that implement [`ports::ChannelAdapter`].

pub mod config;
pub mod cursor;
pub mod cycle;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod ports;
pub mod runtime;
pub mod utils;

pub use errors::{Error, Result};
