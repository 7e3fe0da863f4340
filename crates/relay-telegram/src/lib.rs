//! Telegram Bot API channel for the relay.
//!
//! - [`parser`]: raw update -> normalized inbound message (or a skip reason)
//! - [`api`]: HTTP client with retry/backoff and error classification
//! - [`adapter`]: cursor, dedup and stale-drop bookkeeping behind `ChannelAdapter`

pub mod adapter;
pub mod api;
pub mod parser;

use std::sync::Arc;

use relay_core::{config::RuntimeConfig, cursor::CursorStore, Result};

pub use adapter::{AdapterConfig, TelegramChannelAdapter};
pub use api::{ApiClientConfig, ApiError, ApiErrorKind, BotApi, TelegramApiClient};

/// Wire a client, cursor store and adapter from runtime configuration.
pub fn adapter_from_config(cfg: &RuntimeConfig) -> Result<TelegramChannelAdapter> {
    let client = TelegramApiClient::new(ApiClientConfig::from_runtime(cfg))?;
    let store = cfg.cursor_state_path.clone().map(CursorStore::new);
    TelegramChannelAdapter::new(Arc::new(client), store, AdapterConfig::from_runtime(cfg))
}
