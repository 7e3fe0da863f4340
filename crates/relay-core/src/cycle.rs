//! One fetch -> handle -> send -> ack pass over a [`ChannelAdapter`].
//!
//! Per-item failures are isolated: a failing handler, send or ack is recorded
//! in the result and the loop moves on. Only a failed fetch fails the cycle.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    domain::InboundMessage,
    errors::Error,
    ports::{session_id_for_inbound, ChannelAdapter, MessageHandler, SessionResolver},
    utils::compact_error_text,
};

/// Whether an item's processing failure prevents its acknowledgment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Ack every fetched item, even if handling or sending failed.
    #[default]
    Always,
    /// Ack only items that completed without error; failures are redelivered.
    OnSuccess,
}

impl AckPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnSuccess => "on-success",
        }
    }
}

impl FromStr for AckPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "on-success" => Ok(Self::OnSuccess),
            other => Err(Error::Config(format!(
                "ack_policy must be 'always' or 'on-success' (got '{other}')"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleStatus {
    Ok,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleReason {
    NoUpdates,
    Processed,
    CompletedWithErrors,
    AdapterFetchException,
}

impl CycleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoUpdates => "no-updates",
            Self::Processed => "processed",
            Self::CompletedWithErrors => "completed-with-errors",
            Self::AdapterFetchException => "adapter-fetch-exception",
        }
    }
}

/// Pipeline step an error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleStage {
    Fetch,
    Session,
    Handler,
    Send,
    Ack,
    Diagnostic,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CycleError {
    pub stage: CycleStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<String>,
    pub message: String,
    pub retryable: bool,
}

/// Machine-readable outcome of one cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CycleResult {
    pub status: CycleStatus,
    pub reason: CycleReason,
    pub fetched_count: usize,
    pub sent_count: usize,
    pub acked_count: usize,
    pub ack_skipped_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub error_details: Vec<CycleError>,
}

impl CycleResult {
    fn empty(status: CycleStatus, reason: CycleReason) -> Self {
        Self {
            status,
            reason,
            fetched_count: 0,
            sent_count: 0,
            acked_count: 0,
            ack_skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
            error_details: Vec::new(),
        }
    }

    /// A cycle that failed before any item could be processed.
    pub fn failed(reason: CycleReason, error: CycleError) -> Self {
        let mut out = Self::empty(CycleStatus::Failed, reason);
        out.push_error(error);
        out
    }

    pub fn is_ok(&self) -> bool {
        self.status == CycleStatus::Ok
    }

    /// Record an error, keeping the flat and structured lists in sync.
    pub fn push_error(&mut self, error: CycleError) {
        self.errors.push(error.message.clone());
        self.error_details.push(error);
        self.error_count = self.errors.len();
        if self.status == CycleStatus::Ok {
            self.reason = CycleReason::CompletedWithErrors;
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CycleOptions {
    pub ack_policy: AckPolicy,
    pub session_resolver: SessionResolver,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::default(),
            session_resolver: session_id_for_inbound,
        }
    }
}

/// Run one cycle with the default session mapping.
pub async fn run_once(
    adapter: &mut dyn ChannelAdapter,
    handler: &dyn MessageHandler,
    ack_policy: AckPolicy,
) -> CycleResult {
    let opts = CycleOptions {
        ack_policy,
        ..CycleOptions::default()
    };
    run_once_with(adapter, handler, &opts).await
}

pub async fn run_once_with(
    adapter: &mut dyn ChannelAdapter,
    handler: &dyn MessageHandler,
    opts: &CycleOptions,
) -> CycleResult {
    let updates = match adapter.fetch().await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "adapter fetch failed");
            return CycleResult::failed(
                CycleReason::AdapterFetchException,
                CycleError {
                    stage: CycleStage::Fetch,
                    update_id: None,
                    message: compact_error_text(&e.to_string()),
                    retryable: e.is_transient(),
                },
            );
        }
    };

    if updates.is_empty() {
        return CycleResult::empty(CycleStatus::Ok, CycleReason::NoUpdates);
    }

    let mut out = CycleResult::empty(CycleStatus::Ok, CycleReason::Processed);
    out.fetched_count = updates.len();

    for inbound in &updates {
        let update_id = inbound.update_id();
        let failed = match process_item(adapter, handler, inbound, opts).await {
            Ok(sent) => {
                if sent {
                    out.sent_count += 1;
                }
                false
            }
            Err((stage, e)) => {
                warn!(update_id, stage = ?stage, error = %e, "update processing failed");
                out.push_error(CycleError {
                    stage,
                    update_id: Some(update_id.to_string()),
                    message: compact_error_text(&format!("update {update_id}: {e}")),
                    retryable: e.is_transient(),
                });
                true
            }
        };

        if failed && opts.ack_policy == AckPolicy::OnSuccess {
            out.ack_skipped_count += 1;
            continue;
        }

        match adapter.ack(update_id) {
            Ok(()) => out.acked_count += 1,
            Err(e) => {
                warn!(update_id, error = %e, "ack failed");
                out.push_error(CycleError {
                    stage: CycleStage::Ack,
                    update_id: Some(update_id.to_string()),
                    message: compact_error_text(&format!("update {update_id}: ack failed: {e}")),
                    retryable: e.is_transient(),
                });
            }
        }
    }

    debug!(
        fetched = out.fetched_count,
        sent = out.sent_count,
        acked = out.acked_count,
        ack_skipped = out.ack_skipped_count,
        errors = out.error_count,
        "cycle finished"
    );
    out
}

/// Returns whether a message was sent.
async fn process_item(
    adapter: &mut dyn ChannelAdapter,
    handler: &dyn MessageHandler,
    inbound: &InboundMessage,
    opts: &CycleOptions,
) -> Result<bool, (CycleStage, Error)> {
    let session_id = (opts.session_resolver)(inbound).map_err(|e| (CycleStage::Session, e))?;
    let outbound = handler
        .handle(inbound, &session_id)
        .await
        .map_err(|e| (CycleStage::Handler, e))?;
    let Some(outbound) = outbound else {
        return Ok(false);
    };
    adapter
        .send(&outbound)
        .await
        .map_err(|e| (CycleStage::Send, e))?;
    Ok(true)
}
