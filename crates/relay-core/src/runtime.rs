//! Runtime wiring around the processing cycle.
//!
//! - default echo handler with an optional best-effort memory lookup
//! - allow-list gate in front of any handler
//! - diagnostics draining + best-effort failure notification per cycle
//! - poll loop with cooperative cancellation between cycles

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::RuntimeConfig,
    cycle::{run_once, AckPolicy, CycleError, CycleResult, CycleStage},
    domain::{Diagnostic, DiagnosticCode, InboundMessage, Metadata, OutboundMessage},
    ports::{ChannelAdapter, MessageHandler},
    utils::{compact_error_text, elapsed_ms},
    Result,
};

/// Optional knowledge lookup used to enrich echo replies.
///
/// Failures never reach the caller: the reply is sent without the memory note.
pub type MemoryLookup = Arc<dyn Fn(&str) -> Result<Option<String>> + Send + Sync>;

/// Minimal business logic: echo the text back, optionally with a memory note.
#[derive(Default)]
pub struct EchoHandler {
    memory_lookup: Option<MemoryLookup>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_lookup(mut self, lookup: MemoryLookup) -> Self {
        self.memory_lookup = Some(lookup);
        self
    }

    fn memory_note(&self, inbound: &InboundMessage) -> Option<String> {
        let lookup = self.memory_lookup.as_ref()?;
        match lookup(inbound.text()) {
            Ok(Some(note)) if !note.trim().is_empty() => Some(note.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(update_id = inbound.update_id(), error = %e, "memory lookup failed");
                push_diagnostic(
                    &self.diagnostics,
                    Diagnostic::new(
                        DiagnosticCode::MemoryLookupError,
                        compact_error_text(&format!("memory lookup failed: {e}")),
                    )
                    .for_update(inbound.update_id())
                    .for_chat(inbound.chat_id()),
                );
                None
            }
        }
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        let mut text = format!("echo: {}", inbound.text());
        if let Some(note) = self.memory_note(inbound) {
            text = format!("{text}\n\nmemory: {note}");
        }

        let mut metadata = Metadata::new();
        metadata.insert("session_id".to_string(), json!(session_id));

        let outbound = OutboundMessage::new(inbound.chat_id(), text)?
            .with_reply_to(inbound.message_id().map(str::to_string))
            .with_metadata(metadata);
        Ok(Some(outbound))
    }

    fn drain_diagnostics(&self) -> Vec<Diagnostic> {
        take_diagnostics(&self.diagnostics)
    }
}

/// Drops messages from chats outside the allow-list before the delegate runs.
///
/// An empty allow-list lets everything through.
pub struct AllowlistGate<H> {
    delegate: H,
    allowed: HashSet<String>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl<H: MessageHandler> AllowlistGate<H> {
    pub fn new(delegate: H, allowed_chat_ids: &[String]) -> Self {
        let allowed = allowed_chat_ids
            .iter()
            .filter_map(|id| normalize_chat_id(id))
            .collect();
        Self {
            delegate,
            allowed,
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn is_allowed(&self, chat_id: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        normalize_chat_id(chat_id).is_some_and(|id| self.allowed.contains(&id))
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for AllowlistGate<H> {
    async fn handle(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        if !self.is_allowed(inbound.chat_id()) {
            debug!(
                update_id = inbound.update_id(),
                chat_id = inbound.chat_id(),
                "chat not allow-listed"
            );
            push_diagnostic(
                &self.diagnostics,
                Diagnostic::new(
                    DiagnosticCode::AllowlistDrop,
                    format!(
                        "dropped update {}: chat_id not allowlisted ({})",
                        inbound.update_id(),
                        inbound.chat_id()
                    ),
                )
                .for_update(inbound.update_id())
                .for_chat(inbound.chat_id()),
            );
            return Ok(None);
        }
        self.delegate.handle(inbound, session_id).await
    }

    fn drain_diagnostics(&self) -> Vec<Diagnostic> {
        let mut out = take_diagnostics(&self.diagnostics);
        out.extend(self.delegate.drain_diagnostics());
        out
    }
}

/// Integer-looking chat ids compare numerically (`" 0042"` == `"42"`).
fn normalize_chat_id(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    match text.parse::<i64>() {
        Ok(n) => Some(n.to_string()),
        Err(_) => Some(text.to_string()),
    }
}

fn push_diagnostic(slot: &Mutex<Vec<Diagnostic>>, d: Diagnostic) {
    slot.lock().unwrap_or_else(|e| e.into_inner()).push(d);
}

fn take_diagnostics(slot: &Mutex<Vec<Diagnostic>>) -> Vec<Diagnostic> {
    std::mem::take(&mut *slot.lock().unwrap_or_else(|e| e.into_inner()))
}

/// Best-effort side channel for reporting cycle failures (e.g. to an operator).
///
/// Errors returned here are logged and counted, never propagated.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, text: &str, context: &serde_json::Value) -> Result<()>;
}

/// Result of one runtime cycle: the core result plus drained diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub result: CycleResult,
    pub dropped_count: usize,
    pub dropped_updates: Vec<Diagnostic>,
    pub notify_failures: u32,
    pub elapsed_ms: u64,
}

impl CycleReport {
    /// One-line JSON rendering with the core result fields flattened in.
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Run one cycle, then fold adapter/handler diagnostics into the report.
pub async fn run_cycle(
    adapter: &mut dyn ChannelAdapter,
    handler: &dyn MessageHandler,
    ack_policy: AckPolicy,
    notifier: Option<&dyn FailureNotifier>,
) -> CycleReport {
    let started = Instant::now();
    let mut result = run_once(adapter, handler, ack_policy).await;
    let mut notify_failures = 0u32;

    if !result.is_ok() || result.error_count > 0 {
        let context = json!({
            "code": "service-cycle-error",
            "status": result.status,
            "reason": result.reason,
            "error_count": result.error_count,
            "fetched_count": result.fetched_count,
            "sent_count": result.sent_count,
        });
        let text = format!("channel cycle failure: {}", result.reason.as_str());
        if !notify_best_effort(notifier, &text, &context).await {
            notify_failures += 1;
        }
    }

    let mut diagnostics = handler.drain_diagnostics();
    diagnostics.extend(adapter.drain_diagnostics());

    let mut dropped_updates = Vec::new();
    for d in diagnostics {
        if d.code.is_drop() {
            dropped_updates.push(d);
            continue;
        }
        let retryable = matches!(
            d.code,
            DiagnosticCode::CursorStateLoadError | DiagnosticCode::CursorStateSaveError
        );
        result.push_error(CycleError {
            stage: CycleStage::Diagnostic,
            update_id: d.update_id.clone(),
            message: compact_error_text(&d.message),
            retryable,
        });
        let context = serde_json::to_value(&d).unwrap_or_else(|_| json!({}));
        let text = format!("{} failure: {}", d.code, d.message);
        if !notify_best_effort(notifier, &text, &context).await {
            notify_failures += 1;
        }
    }

    let report = CycleReport {
        result,
        dropped_count: dropped_updates.len(),
        dropped_updates,
        notify_failures,
        elapsed_ms: elapsed_ms(started),
    };
    info!(
        status = ?report.result.status,
        reason = ?report.result.reason,
        fetched = report.result.fetched_count,
        sent = report.result.sent_count,
        acked = report.result.acked_count,
        ack_skipped = report.result.ack_skipped_count,
        errors = report.result.error_count,
        dropped = report.dropped_count,
        elapsed_ms = report.elapsed_ms,
        "cycle complete"
    );
    report
}

/// Returns `true` when no notifier is configured or the notification went through.
async fn notify_best_effort(
    notifier: Option<&dyn FailureNotifier>,
    text: &str,
    context: &serde_json::Value,
) -> bool {
    let Some(notifier) = notifier else {
        return true;
    };
    match notifier.notify(text, context).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failure notification dropped");
            false
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LoopOptions {
    pub ack_policy: AckPolicy,
    pub poll_interval: Duration,
    pub once: bool,
    pub max_cycles: Option<usize>,
}

impl LoopOptions {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            ack_policy: cfg.ack_policy,
            poll_interval: cfg.poll_interval,
            once: cfg.once,
            max_cycles: None,
        }
    }
}

/// Run cycles back-to-back until `once`, `max_cycles`, or cancellation.
///
/// Cancellation is only observed between cycles. Returns the last report, or
/// `None` if cancelled before the first cycle started.
pub async fn run_loop(
    adapter: &mut dyn ChannelAdapter,
    handler: &dyn MessageHandler,
    notifier: Option<&dyn FailureNotifier>,
    opts: &LoopOptions,
    cancel: CancellationToken,
    mut on_cycle: impl FnMut(&CycleReport) + Send,
) -> Option<CycleReport> {
    let mut cycles = 0usize;
    let mut last = None;

    loop {
        if cancel.is_cancelled() {
            return last;
        }

        cycles += 1;
        let report = run_cycle(adapter, handler, opts.ack_policy, notifier).await;
        on_cycle(&report);
        last = Some(report);

        if opts.once || opts.max_cycles.is_some_and(|max| cycles >= max) {
            return last;
        }

        tokio::select! {
            _ = cancel.cancelled() => return last,
            _ = tokio::time::sleep(opts.poll_interval) => {}
        }
    }
}
