//! [`ChannelAdapter`] over the Bot API long-poll feed.
//!
//! The provider delivers at-least-once. This adapter turns that into a
//! resumable cursor: it suppresses duplicates, rejects redeliveries below the
//! durably committed floor, and only advances the floor past ids that were
//! acknowledged (or skipped as unusable).

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use relay_core::{
    config::{RuntimeConfig, MAX_FETCH_LIMIT},
    cursor::{CursorStore, StateError},
    domain::{Diagnostic, DiagnosticCode, InboundMessage, OutboundMessage},
    errors::Error,
    ports::ChannelAdapter,
    Result,
};
use tracing::{debug, warn};

use crate::{
    api::{BotApi, GetUpdates, SendMessage},
    parser::parse_update,
};

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Raise cursor state load/save failures instead of reporting diagnostics.
    pub strict_state_io: bool,
    pub limit: u32,
    pub timeout_seconds: u32,
    pub allowed_updates: Option<Vec<String>>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            strict_state_io: false,
            limit: 100,
            timeout_seconds: 0,
            allowed_updates: None,
        }
    }
}

impl AdapterConfig {
    pub fn from_runtime(cfg: &RuntimeConfig) -> Self {
        Self {
            strict_state_io: cfg.strict_cursor_state_io,
            limit: cfg.fetch_limit,
            timeout_seconds: cfg.poll_timeout_seconds,
            allowed_updates: None,
        }
    }
}

pub struct TelegramChannelAdapter {
    api: Arc<dyn BotApi>,
    store: Option<CursorStore>,
    cfg: AdapterConfig,

    seen_ids: HashSet<i64>,
    pending_ack_ids: HashSet<i64>,
    processed_ids: HashSet<i64>,
    committed_floor: Option<i64>,
    /// Last floor known to be on disk; behind `committed_floor` after a failed save.
    persisted_floor: Option<i64>,
    next_offset: Option<i64>,

    diagnostics: Vec<Diagnostic>,
}

impl TelegramChannelAdapter {
    /// Build the adapter, seeding the cursor from `store` when given.
    ///
    /// In strict mode an unreadable cursor state fails construction.
    pub fn new(api: Arc<dyn BotApi>, store: Option<CursorStore>, cfg: AdapterConfig) -> Result<Self> {
        if cfg.limit == 0 || cfg.limit > MAX_FETCH_LIMIT {
            return Err(Error::Config(format!(
                "fetch limit must be between 1 and {MAX_FETCH_LIMIT} (got {})",
                cfg.limit
            )));
        }

        let mut adapter = Self {
            api,
            store,
            cfg,
            seen_ids: HashSet::new(),
            pending_ack_ids: HashSet::new(),
            processed_ids: HashSet::new(),
            committed_floor: None,
            persisted_floor: None,
            next_offset: None,
            diagnostics: Vec::new(),
        };

        if let Some(store) = adapter.store.clone() {
            match store.load() {
                Ok(snapshot) => {
                    adapter.committed_floor = snapshot.committed_floor;
                    adapter.persisted_floor = snapshot.committed_floor;
                }
                Err(e) => adapter.on_state_error(e)?,
            }
        }
        adapter.next_offset = adapter.committed_floor;
        Ok(adapter)
    }

    /// Offset the next `getUpdates` call will request.
    pub fn next_offset(&self) -> Option<i64> {
        self.next_offset
    }

    pub fn committed_floor(&self) -> Option<i64> {
        self.committed_floor
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_ack_ids.len()
    }

    fn on_state_error(&mut self, e: StateError) -> Result<()> {
        let (code, label) = if e.kind.is_load() {
            (DiagnosticCode::CursorStateLoadError, "load")
        } else {
            (DiagnosticCode::CursorStateSaveError, "save")
        };
        let message = format!("cursor_state_{label} failed: {e}");
        let path = self
            .store
            .as_ref()
            .map(|s| s.path().display().to_string())
            .unwrap_or_default();
        warn!(strict = self.cfg.strict_state_io, path = %path, "{message}");
        self.diagnostics.push(Diagnostic::new(code, message));
        if self.cfg.strict_state_io {
            return Err(Error::State(e));
        }
        Ok(())
    }

    /// Recompute `next_offset` and persist the floor if it is ahead of disk.
    ///
    /// The floor never regresses: the candidate is clamped to the current
    /// floor before being compared against it. A floor whose save failed
    /// stays dirty and is retried on the next recompute.
    fn recompute_offset(&mut self) -> Result<()> {
        let mut candidate = if let Some(min) = self.pending_ack_ids.iter().min() {
            Some(*min)
        } else if let Some(max) = self.seen_ids.iter().max() {
            Some(max.saturating_add(1))
        } else {
            self.committed_floor
        };
        if let (Some(c), Some(floor)) = (candidate, self.committed_floor) {
            candidate = Some(c.max(floor));
        }
        self.next_offset = candidate;

        if let Some(c) = candidate {
            if self.committed_floor.map_or(true, |floor| c > floor) {
                self.committed_floor = Some(c);
            }
        }
        self.evict_below_floor();
        self.persist_floor()
    }

    fn persist_floor(&mut self) -> Result<()> {
        let Some(floor) = self.committed_floor else {
            return Ok(());
        };
        if self.persisted_floor.is_some_and(|p| p >= floor) {
            return Ok(());
        }
        match self.store.as_ref().map(|store| store.save(floor)) {
            None => Ok(()),
            Some(Ok(())) => {
                self.persisted_floor = Some(floor);
                Ok(())
            }
            Some(Err(e)) => self.on_state_error(e),
        }
    }

    /// Ids under the floor are covered by the stale-drop rule, so they no
    /// longer need to be remembered.
    fn evict_below_floor(&mut self) {
        let Some(floor) = self.committed_floor else {
            return;
        };
        self.seen_ids.retain(|id| *id >= floor);
        self.processed_ids.retain(|id| *id >= floor);
    }
}

#[async_trait]
impl ChannelAdapter for TelegramChannelAdapter {
    async fn fetch(&mut self) -> Result<Vec<InboundMessage>> {
        let req = GetUpdates {
            offset: self.next_offset,
            limit: self.cfg.limit,
            timeout_seconds: self.cfg.timeout_seconds,
            allowed_updates: self.cfg.allowed_updates.clone(),
        };
        let raw_updates = self.api.get_updates(&req).await.map_err(Error::from)?;

        let mut out = Vec::new();
        let mut seen_in_batch = HashSet::new();
        for raw in &raw_updates {
            let parsed = parse_update(raw);
            let Some(update_id) = parsed.update_id else {
                debug!("skipping update without a usable id");
                continue;
            };

            if !seen_in_batch.insert(update_id) {
                debug!(update_id, "duplicate update in batch");
                self.processed_ids.insert(update_id);
                continue;
            }

            if let Some(floor) = self.committed_floor {
                if update_id < floor {
                    warn!(update_id, floor, "dropping stale update below committed floor");
                    self.processed_ids.insert(update_id);
                    self.diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::StaleDrop,
                            format!(
                                "dropped stale update {update_id} below committed floor {floor}"
                            ),
                        )
                        .for_update(update_id),
                    );
                    continue;
                }
            }

            if self.seen_ids.contains(&update_id) && !self.pending_ack_ids.contains(&update_id) {
                self.processed_ids.insert(update_id);
                continue;
            }

            self.seen_ids.insert(update_id);
            match parsed.inbound {
                Some(inbound) => {
                    self.pending_ack_ids.insert(update_id);
                    out.push(inbound);
                }
                None => {
                    if let Some(reason) = parsed.skip_reason {
                        debug!(update_id, reason = %reason, "skipping update");
                    }
                    self.processed_ids.insert(update_id);
                }
            }
        }

        self.recompute_offset()?;
        debug!(
            fetched = raw_updates.len(),
            emitted = out.len(),
            pending = self.pending_ack_count(),
            next_offset = ?self.next_offset,
            "fetch complete"
        );
        Ok(out)
    }

    async fn send(&mut self, outbound: &OutboundMessage) -> Result<()> {
        let req = SendMessage {
            chat_id: outbound.chat_id().to_string(),
            text: outbound.text().to_string(),
            reply_to_message_id: outbound.reply_to_message_id().map(str::to_string),
        };
        self.api.send_message(&req).await.map_err(Error::from)?;
        Ok(())
    }

    fn ack(&mut self, update_id: &str) -> Result<()> {
        let id = match update_id.trim().parse::<i64>() {
            Ok(id) if id >= 0 => id,
            _ => {
                return Err(Error::Contract(format!(
                    "ack requires a numeric update_id (got '{update_id}')"
                )))
            }
        };

        self.seen_ids.insert(id);
        self.pending_ack_ids.remove(&id);
        self.processed_ids.insert(id);
        self.recompute_offset()
    }

    fn drain_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ApiErrorKind};
    use relay_core::{
        cursor::StateErrorKind,
        cycle::{run_once, AckPolicy, CycleReason},
        runtime::EchoHandler,
    };
    use serde_json::{json, Map, Value};
    use std::{collections::VecDeque, fs, sync::Mutex};
    use tempfile::tempdir;

    type Batch = std::result::Result<Vec<Map<String, Value>>, ApiError>;

    #[derive(Default)]
    struct FakeBotApi {
        batches: Mutex<VecDeque<Batch>>,
        offsets: Mutex<Vec<Option<i64>>>,
        sent: Mutex<Vec<SendMessage>>,
        send_error: Mutex<Option<ApiError>>,
    }

    impl FakeBotApi {
        fn push(&self, ids: &[i64]) {
            let batch = ids.iter().map(|id| text_update(*id)).collect();
            self.push_raw(batch);
        }

        fn push_raw(&self, batch: Vec<Map<String, Value>>) {
            self.batches.lock().unwrap().push_back(Ok(batch));
        }

        fn offsets(&self) -> Vec<Option<i64>> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BotApi for FakeBotApi {
        async fn get_updates(
            &self,
            req: &GetUpdates,
        ) -> std::result::Result<Vec<Map<String, Value>>, ApiError> {
            self.offsets.lock().unwrap().push(req.offset);
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn send_message(
            &self,
            req: &SendMessage,
        ) -> std::result::Result<Map<String, Value>, ApiError> {
            if let Some(e) = self.send_error.lock().unwrap().clone() {
                return Err(e);
            }
            self.sent.lock().unwrap().push(req.clone());
            Ok(Map::new())
        }
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            other => panic!("not an object: {other}"),
        }
    }

    fn text_update(id: i64) -> Map<String, Value> {
        obj(json!({
            "update_id": id,
            "message": {
                "message_id": id * 10,
                "text": format!("msg {id}"),
                "chat": {"id": 500},
                "from": {"id": 600}
            }
        }))
    }

    fn adapter(api: &Arc<FakeBotApi>, store: Option<CursorStore>) -> TelegramChannelAdapter {
        TelegramChannelAdapter::new(api.clone(), store, AdapterConfig::default()).unwrap()
    }

    fn ids(msgs: &[InboundMessage]) -> Vec<&str> {
        msgs.iter().map(|m| m.update_id()).collect()
    }

    #[tokio::test]
    async fn offset_tracks_smallest_pending_then_max_seen() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[11, 12]);
        let mut a = adapter(&api, None);
        assert_eq!(a.next_offset(), None);

        let msgs = a.fetch().await.unwrap();
        assert_eq!(ids(&msgs), vec!["11", "12"]);
        assert_eq!(a.next_offset(), Some(11));

        a.ack("11").unwrap();
        assert_eq!(a.next_offset(), Some(12));
        a.ack("12").unwrap();
        assert_eq!(a.next_offset(), Some(13));
        assert_eq!(a.committed_floor(), Some(13));
    }

    #[tokio::test]
    async fn acking_out_of_order_waits_for_the_oldest_pending() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[11, 12]);
        let mut a = adapter(&api, None);
        a.fetch().await.unwrap();

        a.ack("12").unwrap();
        assert_eq!(a.next_offset(), Some(11));
        a.ack("11").unwrap();
        assert_eq!(a.next_offset(), Some(13));
    }

    #[tokio::test]
    async fn duplicates_are_suppressed_within_and_across_batches() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[7, 7, 8]);
        api.push(&[7, 8]);
        let mut a = adapter(&api, None);

        let first = a.fetch().await.unwrap();
        assert_eq!(ids(&first), vec!["7", "8"]);
        a.ack("7").unwrap();
        a.ack("8").unwrap();

        let second = a.fetch().await.unwrap();
        assert!(second.is_empty());
        // Both are below the floor by now and reported as stale.
        let codes: Vec<_> = a.drain_diagnostics().into_iter().map(|d| d.code).collect();
        assert_eq!(codes, vec![DiagnosticCode::StaleDrop, DiagnosticCode::StaleDrop]);
    }

    #[tokio::test]
    async fn acked_id_above_floor_is_dropped_silently_on_redelivery() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[11, 12]);
        api.push(&[11, 12]);
        let mut a = adapter(&api, None);
        a.fetch().await.unwrap();
        a.ack("12").unwrap();

        // 11 still pending keeps the floor at 11, so 12 is remembered as seen.
        let again = a.fetch().await.unwrap();
        assert_eq!(ids(&again), vec!["11"]);
        assert!(a.drain_diagnostics().is_empty());
    }

    #[tokio::test]
    async fn unacked_update_is_redelivered() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[5]);
        api.push(&[5]);
        let mut a = adapter(&api, None);

        assert_eq!(ids(&a.fetch().await.unwrap()), vec!["5"]);
        assert_eq!(ids(&a.fetch().await.unwrap()), vec!["5"]);
        assert_eq!(api.offsets(), vec![None, Some(5)]);
        assert_eq!(a.pending_ack_count(), 1);
    }

    #[tokio::test]
    async fn updates_below_persisted_floor_are_stale() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(dir.path().join("cursor.json"));
        store.save(20).unwrap();

        let api = Arc::new(FakeBotApi::default());
        api.push(&[19, 20]);
        let mut a = adapter(&api, Some(store));
        assert_eq!(a.next_offset(), Some(20));

        let msgs = a.fetch().await.unwrap();
        assert_eq!(ids(&msgs), vec!["20"]);
        let diags = a.drain_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::StaleDrop);
        assert_eq!(diags[0].update_id.as_deref(), Some("19"));
        assert!(diags[0].message.contains("20"));
        assert!(a.drain_diagnostics().is_empty());
    }

    #[tokio::test]
    async fn committed_floor_never_decreases() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[3, 4, 5]);
        api.push(&[2, 6]);
        api.push(&[4, 7]);
        let mut a = adapter(&api, None);

        let mut floors = Vec::new();
        a.fetch().await.unwrap();
        floors.push(a.committed_floor());
        for id in ["5", "3", "4"] {
            a.ack(id).unwrap();
            floors.push(a.committed_floor());
        }
        a.fetch().await.unwrap();
        floors.push(a.committed_floor());
        // Acking an id far below the floor must not pull it back.
        a.ack("1").unwrap();
        floors.push(a.committed_floor());
        a.ack("6").unwrap();
        floors.push(a.committed_floor());
        a.fetch().await.unwrap();
        floors.push(a.committed_floor());

        for pair in floors.windows(2) {
            assert!(pair[0] <= pair[1], "{floors:?}");
        }
        assert_eq!(floors.last().copied().flatten(), Some(7));
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_floor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/cursor.json");

        let api = Arc::new(FakeBotApi::default());
        api.push(&[30, 31]);
        let mut a = adapter(&api, Some(CursorStore::new(&path)));
        a.fetch().await.unwrap();
        a.ack("30").unwrap();
        a.ack("31").unwrap();
        drop(a);

        let api = Arc::new(FakeBotApi::default());
        let mut b = adapter(&api, Some(CursorStore::new(&path)));
        assert_eq!(b.committed_floor(), Some(32));
        b.fetch().await.unwrap();
        assert_eq!(api.offsets(), vec![Some(32)]);
    }

    #[tokio::test]
    async fn crash_before_ack_redelivers_from_pending_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");

        let api = Arc::new(FakeBotApi::default());
        api.push(&[40, 41]);
        let mut a = adapter(&api, Some(CursorStore::new(&path)));
        a.fetch().await.unwrap();
        a.ack("40").unwrap();
        drop(a);

        let b = adapter(&Arc::new(FakeBotApi::default()), Some(CursorStore::new(&path)));
        assert_eq!(b.next_offset(), Some(41));
    }

    #[tokio::test]
    async fn skipped_updates_still_advance_the_offset() {
        let api = Arc::new(FakeBotApi::default());
        api.push_raw(vec![
            obj(json!({"update_id": 7, "edited_message": {"text": "x"}})),
            obj(json!({"update_id": "junk"})),
        ]);
        let mut a = adapter(&api, None);

        assert!(a.fetch().await.unwrap().is_empty());
        assert_eq!(a.next_offset(), Some(8));
        assert_eq!(a.pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn batch_of_only_invalid_ids_leaves_cursor_unset() {
        let api = Arc::new(FakeBotApi::default());
        api.push_raw(vec![obj(json!({"update_id": "junk"}))]);
        let mut a = adapter(&api, None);
        assert!(a.fetch().await.unwrap().is_empty());
        assert_eq!(a.next_offset(), None);
    }

    #[tokio::test]
    async fn ids_below_floor_are_evicted() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&(1..=50).collect::<Vec<_>>());
        let mut a = adapter(&api, None);
        a.fetch().await.unwrap();
        for id in 1..=50 {
            a.ack(&id.to_string()).unwrap();
        }
        assert_eq!(a.committed_floor(), Some(51));
        assert!(a.seen_ids.is_empty());
        assert!(a.processed_ids.is_empty());
    }

    #[tokio::test]
    async fn non_numeric_ack_is_rejected() {
        let api = Arc::new(FakeBotApi::default());
        let mut a = adapter(&api, None);
        for bad in ["abc", "", "-3"] {
            assert!(matches!(a.ack(bad), Err(Error::Contract(_))), "{bad}");
        }
        assert_eq!(a.next_offset(), None);
    }

    #[tokio::test]
    async fn unreadable_state_is_a_diagnostic_unless_strict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        fs::write(&path, "{broken").unwrap();
        let api: Arc<FakeBotApi> = Arc::new(FakeBotApi::default());

        let mut lenient = adapter(&api, Some(CursorStore::new(&path)));
        assert_eq!(lenient.committed_floor(), None);
        let diags = lenient.drain_diagnostics();
        assert_eq!(diags[0].code, DiagnosticCode::CursorStateLoadError);
        assert!(diags[0].message.starts_with("cursor_state_load failed: state-load-json"));

        let strict = TelegramChannelAdapter::new(
            api,
            Some(CursorStore::new(&path)),
            AdapterConfig {
                strict_state_io: true,
                ..AdapterConfig::default()
            },
        );
        match strict {
            Err(Error::State(e)) => assert_eq!(e.kind, StateErrorKind::LoadJson),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("strict load should fail"),
        }
    }

    #[tokio::test]
    async fn save_failure_is_a_diagnostic_unless_strict() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("cursor.json");

        let api = Arc::new(FakeBotApi::default());
        api.push(&[1]);
        let mut lenient = adapter(&api, Some(CursorStore::new(&path)));
        assert_eq!(ids(&lenient.fetch().await.unwrap()), vec!["1"]);
        let diags = lenient.drain_diagnostics();
        assert_eq!(diags[0].code, DiagnosticCode::CursorStateSaveError);

        let api = Arc::new(FakeBotApi::default());
        api.push(&[1]);
        let mut strict = TelegramChannelAdapter::new(
            api.clone(),
            Some(CursorStore::new(&path)),
            AdapterConfig {
                strict_state_io: true,
                ..AdapterConfig::default()
            },
        )
        .unwrap();
        match strict.fetch().await {
            Err(Error::State(e)) => assert_eq!(e.kind, StateErrorKind::SaveIo),
            other => panic!("expected save error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_floor_is_saved_once_the_disk_recovers() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("state");
        fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("cursor.json");

        let api = Arc::new(FakeBotApi::default());
        api.push(&[1]);
        api.push(&[1]);
        let mut a = TelegramChannelAdapter::new(
            api.clone(),
            Some(CursorStore::new(&path)),
            AdapterConfig {
                strict_state_io: true,
                ..AdapterConfig::default()
            },
        )
        .unwrap();

        assert!(matches!(a.fetch().await, Err(Error::State(_))));
        assert_eq!(a.committed_floor(), Some(1));

        fs::remove_file(&blocker).unwrap();
        assert_eq!(ids(&a.fetch().await.unwrap()), vec!["1"]);
        assert_eq!(CursorStore::new(&path).load().unwrap().committed_floor, Some(1));

        a.ack("1").unwrap();
        assert_eq!(CursorStore::new(&path).load().unwrap().committed_floor, Some(2));
    }

    #[tokio::test]
    async fn lenient_save_failure_is_retried_on_later_recomputes() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("state");
        fs::write(&blocker, "not a directory").unwrap();
        let path = blocker.join("cursor.json");

        let api = Arc::new(FakeBotApi::default());
        api.push(&[4]);
        let mut a = adapter(&api, Some(CursorStore::new(&path)));
        a.fetch().await.unwrap();
        assert_eq!(a.drain_diagnostics().len(), 1);

        fs::remove_file(&blocker).unwrap();
        a.fetch().await.unwrap();
        assert!(a.drain_diagnostics().is_empty());
        assert_eq!(CursorStore::new(&path).load().unwrap().committed_floor, Some(4));
    }

    #[test]
    fn fetch_limit_is_validated() {
        let api: Arc<FakeBotApi> = Arc::new(FakeBotApi::default());
        for limit in [0, 101, 5000] {
            let built = TelegramChannelAdapter::new(
                api.clone(),
                None,
                AdapterConfig {
                    limit,
                    ..AdapterConfig::default()
                },
            );
            assert!(matches!(built, Err(Error::Config(_))), "limit {limit}");
        }
        for limit in [1, 100] {
            let cfg = AdapterConfig {
                limit,
                ..AdapterConfig::default()
            };
            assert!(TelegramChannelAdapter::new(api.clone(), None, cfg).is_ok());
        }
    }

    #[tokio::test]
    async fn fetch_failure_is_wrapped_as_channel_error() {
        let api = Arc::new(FakeBotApi::default());
        api.batches.lock().unwrap().push_back(Err(ApiError {
            operation: "getUpdates".to_string(),
            kind: ApiErrorKind::Timeout,
            transient: true,
            description: "deadline".to_string(),
            status_code: None,
            api_error_code: None,
            retry_after_seconds: None,
        }));
        let mut a = adapter(&api, None);

        let err = a.fetch().await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("getUpdates failed:"));
        assert!(err.to_string().contains("\"kind\":\"timeout\""));
    }

    #[tokio::test]
    async fn send_maps_outbound_to_request() {
        let api = Arc::new(FakeBotApi::default());
        let mut a = adapter(&api, None);
        let out = OutboundMessage::new("500", "hello")
            .unwrap()
            .with_reply_to(Some("70".to_string()));
        a.send(&out).await.unwrap();

        let sent = api.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![SendMessage {
                chat_id: "500".to_string(),
                text: "hello".to_string(),
                reply_to_message_id: Some("70".to_string()),
            }]
        );

        *api.send_error.lock().unwrap() = Some(ApiError {
            operation: "sendMessage".to_string(),
            kind: ApiErrorKind::HttpError,
            transient: false,
            description: "Bad Request".to_string(),
            status_code: Some(400),
            api_error_code: Some(400),
            retry_after_seconds: None,
        });
        let err = a.send(&out).await.unwrap_err();
        assert!(matches!(err, Error::Channel { transient: false, .. }));
    }

    #[tokio::test]
    async fn end_to_end_cycles_resume_and_drop_stale() {
        let dir = tempdir().unwrap();
        let api = Arc::new(FakeBotApi::default());
        api.push(&[30, 31]);
        api.push(&[29, 32]);
        let mut a = adapter(&api, Some(CursorStore::new(dir.path().join("c.json"))));
        let handler = EchoHandler::new();

        let first = run_once(&mut a, &handler, AckPolicy::Always).await;
        assert_eq!(first.reason, CycleReason::Processed);
        assert_eq!((first.fetched_count, first.sent_count, first.acked_count), (2, 2, 2));
        assert_eq!(a.next_offset(), Some(32));

        let second = run_once(&mut a, &handler, AckPolicy::Always).await;
        assert_eq!(second.fetched_count, 1);
        assert_eq!(api.offsets(), vec![None, Some(32)]);

        let diags = a.drain_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::StaleDrop);
        assert_eq!(diags[0].update_id.as_deref(), Some("29"));

        let texts: Vec<_> = api
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.text.clone())
            .collect();
        assert_eq!(texts, vec!["echo: msg 30", "echo: msg 31", "echo: msg 32"]);
        assert_eq!(a.committed_floor(), Some(33));
    }

    #[tokio::test]
    async fn on_success_policy_leaves_failed_send_pending() {
        let api = Arc::new(FakeBotApi::default());
        api.push(&[1]);
        *api.send_error.lock().unwrap() = Some(ApiError {
            operation: "sendMessage".to_string(),
            kind: ApiErrorKind::HttpError,
            transient: true,
            description: "Service Unavailable".to_string(),
            status_code: Some(503),
            api_error_code: None,
            retry_after_seconds: None,
        });
        let mut a = adapter(&api, None);

        let result = run_once(&mut a, &EchoHandler::new(), AckPolicy::OnSuccess).await;
        assert_eq!(result.reason, CycleReason::CompletedWithErrors);
        assert_eq!(result.ack_skipped_count, 1);
        assert_eq!(a.pending_ack_count(), 1);
        assert_eq!(a.next_offset(), Some(1));
    }
}
