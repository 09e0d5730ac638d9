//! The sync client.
//!
//! [`SyncClient`] ties a [`Transport`], a [`Scene`], the durable local queue
//! and the reconciliation engine together for one room. It is driven from a
//! single task: the host calls its operations, and transport events are fed
//! in through [`SyncClient::handle_event`]. Every handler runs to completion.

use crate::config::ClientConfig;
use crate::transport::{ConnectionState, Transport, TransportEvent};
use scenesync_core::{
    merge_relayed, AckHistory, ApplyError, Change, Delta, DeltaId, DeltasRepository, ElementMap,
    ErrorSink,
    LocalDeltaQueue, MetadataRepository, QueueError, Reconciliation, ReconciliationEngine,
    RepositoryError, Scene, SyncFault, SyncMetadata,
};
use scenesync_proto::{ClientMessage, Reassembler, Rejection, ServerMessage};
use std::time::Duration;
use tokio::time::Instant;

/// Client options that do not concern the transport.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Acknowledged deltas kept in memory
    pub history_retention: usize,
    /// Quiet period before a scheduled resync fires
    pub resync_debounce: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SyncOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            history_retention: config.history_retention,
            resync_debounce: config.resync_debounce,
        }
    }
}

/// Orchestrates one room's sync session.
pub struct SyncClient<T, S, R> {
    transport: T,
    scene: S,
    queue: LocalDeltaQueue<R>,
    engine: ReconciliationEngine,
    reassembler: Reassembler,
    errors: Box<dyn ErrorSink>,
    resync_debounce: Duration,
    resync_at: Option<Instant>,
}

impl<T, S, R> std::fmt::Debug for SyncClient<T, S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("last_acknowledged_version", &self.engine.last_acknowledged_version())
            .field("resync_at", &self.resync_at)
            .finish_non_exhaustive()
    }
}

impl<T, S, R> SyncClient<T, S, R>
where
    T: Transport,
    S: Scene,
    R: DeltasRepository + MetadataRepository,
{
    /// Load the persisted queue and resume point of `room_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the repository cannot be read.
    pub fn create(
        room_id: impl Into<String>,
        transport: T,
        scene: S,
        repository: R,
        options: SyncOptions,
        errors: Box<dyn ErrorSink>,
    ) -> Result<Self, ClientError> {
        let room_id = room_id.into();
        let metadata = repository.load_metadata(&room_id)?.unwrap_or_default();
        let queue = LocalDeltaQueue::create(repository, room_id)?;

        tracing::info!(
            room_id = %queue.room_id(),
            last_acknowledged_version = metadata.last_acknowledged_version,
            queued = queue.len(),
            "Sync client created"
        );

        Ok(Self {
            transport,
            scene,
            queue,
            engine: ReconciliationEngine::new(
                metadata.last_acknowledged_version,
                AckHistory::new(options.history_retention),
            ),
            reassembler: Reassembler::default(),
            errors,
            resync_debounce: options.resync_debounce,
            resync_at: None,
        })
    }

    /// The room this client syncs.
    #[must_use]
    pub fn room_id(&self) -> &str {
        self.queue.room_id()
    }

    /// Highest server version reflected in the scene.
    #[must_use]
    pub fn last_acknowledged_version(&self) -> u64 {
        self.engine.last_acknowledged_version()
    }

    /// Acknowledged deltas retained this session, ascending by version.
    pub fn acknowledged_deltas(&self) -> impl Iterator<Item = &scenesync_core::AcknowledgedDelta> {
        self.engine.history().iter()
    }

    /// Local deltas not yet acknowledged, in queue order.
    #[must_use]
    pub fn queued_deltas(&self) -> Vec<Delta> {
        self.queue.get_all()
    }

    /// Connection state of the transport.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// The scene this client publishes into.
    #[must_use]
    pub fn scene(&self) -> &S {
        &self.scene
    }

    /// The transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start connecting.
    pub fn connect(&mut self) {
        self.transport.connect();
    }

    /// Drop the connection and any partially received chunks.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.reassembler.clear();
    }

    /// Ask for acknowledged deltas after `since`, or after the current
    /// version when `None`.
    pub fn pull(&mut self, since: Option<u64>) {
        let version = since.unwrap_or_else(|| self.engine.last_acknowledged_version());
        tracing::debug!(room_id = %self.room_id(), version, "Pulling");
        self.transport.send(&ClientMessage::pull(version));
    }

    /// Queue `delta` (if any) and send every queued delta in order.
    pub fn push(&mut self, delta: Option<Delta>) {
        if let Some(delta) = delta {
            let delta_id = delta.id.clone();
            if let Err(err) = self.queue.add(delta) {
                tracing::error!(error = %err, %delta_id, "Failed to persist queued delta");
            }
        }

        let pending = self.queue.get_all();
        tracing::debug!(room_id = %self.room_id(), queued = pending.len(), "Pushing queued deltas");
        for delta in pending {
            self.transport.send(&ClientMessage::Push(delta));
        }
    }

    /// Broadcast an ephemeral change.
    pub fn relay(&mut self, change: Change) {
        self.transport.send(&ClientMessage::Relay(change));
    }

    /// React to a transport notification.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                tracing::info!(room_id = %self.room_id(), "Connection open, catching up");
                self.pull(Some(0));
                self.push(None);
            }
            TransportEvent::Online => {
                tracing::info!(room_id = %self.room_id(), "Back online, catching up");
                self.pull(None);
                self.push(None);
            }
            TransportEvent::Message(frame) => self.handle_frame(&frame),
            TransportEvent::Closed => {
                tracing::debug!(room_id = %self.room_id(), "Connection closed");
                self.reassembler.clear();
            }
        }
    }

    /// Decode and dispatch one raw inbound frame.
    pub fn handle_frame(&mut self, frame: &str) {
        match self.reassembler.accept(frame) {
            Ok(Some(message)) => self.handle_message(message),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, payload_len = frame.len(), "Dropped malformed frame");
            }
        }
    }

    /// Dispatch one decoded server message.
    pub fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Relayed(change) => self.handle_relayed(&change),
            ServerMessage::Acknowledged(ack) => self.handle_acknowledged(&ack.deltas),
            ServerMessage::Rejected(rejection) => self.handle_rejected(rejection),
        }
    }

    fn handle_relayed(&mut self, change: &Change) {
        let mut elements = self.scene.elements();
        let updated = merge_relayed(&mut elements, change);
        if updated.is_empty() {
            return;
        }

        tracing::debug!(room_id = %self.room_id(), updated = updated.len(), "Merged relayed change");
        self.scene.replace_elements(elements);
    }

    fn handle_acknowledged(&mut self, deltas: &[scenesync_core::AcknowledgedDelta]) {
        match self
            .engine
            .reconcile(deltas, &mut self.scene, &mut self.queue)
        {
            Reconciliation::Applied(summary) => {
                if summary.version == summary.previous_version {
                    return;
                }

                let metadata = SyncMetadata {
                    last_acknowledged_version: summary.version,
                };
                if let Err(err) = self
                    .queue
                    .repository()
                    .save_metadata(self.queue.room_id(), &metadata)
                {
                    tracing::error!(error = %err, version = summary.version, "Failed to persist sync metadata");
                }
            }
            Reconciliation::Fault(fault) => {
                self.errors.report(&SyncFault::Resync(fault));
                self.schedule_resync();
            }
        }
    }

    fn handle_rejected(&mut self, rejection: Rejection) {
        let rejected: Vec<Delta> = rejection
            .ids
            .iter()
            .filter_map(|id| self.queue.get(id).cloned())
            .collect();

        if rejected.is_empty() {
            tracing::debug!(
                room_id = %self.room_id(),
                ids = rejection.ids.len(),
                "Ignoring rejection of deltas no longer queued"
            );
            return;
        }

        let ids: Vec<DeltaId> = rejected.iter().map(|delta| delta.id.clone()).collect();
        if let Err(err) = self.queue.remove_all(&ids) {
            tracing::error!(error = %err, "Failed to persist rejected queue removals");
        }

        match self.rebuild_without(&rejected) {
            Ok(elements) => self.scene.replace_elements(elements),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to roll back rejected deltas");
                self.schedule_resync();
            }
        }

        self.errors.report(&SyncFault::Rejected {
            ids,
            message: rejection.message,
        });
    }

    /// Revert `rejected` newest first, then reapply the still-queued deltas
    /// in queue order so later local edits survive.
    fn rebuild_without(&self, rejected: &[Delta]) -> Result<ElementMap, ApplyError> {
        let mut elements = self.scene.elements();
        for delta in rejected.iter().rev() {
            self.scene.revert_delta(delta, &mut elements)?;
        }
        for delta in self.queue.iter() {
            self.scene.apply_delta(delta, &mut elements)?;
        }
        Ok(elements)
    }

    /// Schedule a full resync after the debounce period, pushing back any
    /// resync already scheduled.
    pub fn schedule_resync(&mut self) {
        let deadline = Instant::now() + self.resync_debounce;
        tracing::debug!(room_id = %self.room_id(), "Resync scheduled");
        self.resync_at = Some(deadline);
    }

    /// When the scheduled resync is due, if any.
    #[must_use]
    pub fn resync_deadline(&self) -> Option<Instant> {
        self.resync_at
    }

    /// Run the scheduled resync if it is due at `now`.
    ///
    /// Returns `true` if a resync pull was issued.
    pub fn poll_resync(&mut self, now: Instant) -> bool {
        match self.resync_at {
            Some(deadline) if deadline <= now => {
                self.resync_at = None;
                tracing::info!(room_id = %self.room_id(), "Resynchronizing from version 0");
                self.pull(Some(0));
                true
            }
            _ => false,
        }
    }
}

/// Errors creating a client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The queue could not be loaded
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Metadata could not be loaded
    #[error("failed to load sync metadata: {0}")]
    Metadata(#[from] RepositoryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use scenesync_core::{AcknowledgedDelta, Element, MemoryRepository, SceneDelta, SharedScene};
    use scenesync_proto::Acknowledgement;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        faults: Arc<Mutex<Vec<SyncFault>>>,
    }

    impl RecordingSink {
        fn faults(&self) -> Vec<SyncFault> {
            self.faults.lock().unwrap().clone()
        }
    }

    impl ErrorSink for RecordingSink {
        fn report(&self, fault: &SyncFault) {
            self.faults.lock().unwrap().push(fault.clone());
        }
    }

    struct Harness {
        client: SyncClient<MockTransport, SharedScene, MemoryRepository>,
        transport: MockTransport,
        scene: SharedScene,
        repository: MemoryRepository,
        sink: RecordingSink,
    }

    fn harness_with(repository: MemoryRepository, scene: SharedScene) -> Harness {
        let transport = MockTransport::online();
        let sink = RecordingSink::default();
        let client = SyncClient::create(
            "room",
            transport.clone(),
            scene.clone(),
            repository.clone(),
            SyncOptions::default(),
            Box::new(sink.clone()),
        )
        .unwrap();

        Harness {
            client,
            transport,
            scene,
            repository,
            sink,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryRepository::new(), SharedScene::new())
    }

    fn pushed_ids(messages: &[ClientMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|message| match message {
                ClientMessage::Push(delta) => Some(delta.id.to_string()),
                _ => None,
            })
            .collect()
    }

    fn acknowledged(deltas: Vec<AcknowledgedDelta>) -> ServerMessage {
        ServerMessage::Acknowledged(Acknowledgement { deltas })
    }

    #[test]
    fn open_pulls_from_zero_then_pushes_queue() {
        let mut h = harness();
        h.client
            .push(Some(Delta::with_id("d1", serde_json::json!({"elements": {}}))));
        h.transport.take_sent();

        h.client.handle_event(TransportEvent::Open);

        let sent = h.transport.sent();
        assert_eq!(sent[0], ClientMessage::pull(0));
        assert_eq!(pushed_ids(&sent[1..]), vec!["d1"]);
    }

    #[test]
    fn online_pulls_from_current_version() {
        let repository = MemoryRepository::new();
        repository
            .save_metadata(
                "room",
                &SyncMetadata {
                    last_acknowledged_version: 9,
                },
            )
            .unwrap();
        let mut h = harness_with(repository, SharedScene::new());

        h.client.handle_event(TransportEvent::Online);

        assert_eq!(h.transport.sent(), vec![ClientMessage::pull(9)]);
        assert_eq!(h.client.last_acknowledged_version(), 9);
    }

    #[test]
    fn offline_push_is_queued_and_sent_in_order_later() {
        let mut h = harness();
        h.transport.set_state(ConnectionState::Offline);

        let d1 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(None, Element::new("a", 1)))
            .unwrap();
        let d2 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(None, Element::new("b", 1)))
            .unwrap();
        h.client.push(Some(d1.clone()));
        h.client.push(Some(d2.clone()));
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.repository.load_deltas("room").unwrap().len(), 2);

        h.transport.set_state(ConnectionState::Online);
        h.client.push(None);

        assert_eq!(
            pushed_ids(&h.transport.sent()),
            vec![d1.id.to_string(), d2.id.to_string()]
        );
    }

    #[test]
    fn acknowledgement_clears_queue_and_persists_version() {
        let mut h = harness();
        let d1 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(None, Element::new("a", 1)))
            .unwrap();
        h.client.push(Some(d1.clone()));

        h.client
            .handle_message(acknowledged(vec![AcknowledgedDelta::from_delta(&d1, 1)]));

        assert!(h.client.queued_deltas().is_empty());
        assert_eq!(h.client.last_acknowledged_version(), 1);
        assert_eq!(
            h.repository.load_metadata("room").unwrap(),
            Some(SyncMetadata {
                last_acknowledged_version: 1
            })
        );
        assert_eq!(h.client.acknowledged_deltas().count(), 1);
        assert!(h.scene.get("a").is_some());
    }

    #[test]
    fn out_of_order_batch_schedules_resync() {
        let mut h = harness();
        let before = h.scene.snapshot();
        let remote = Delta::with_id(
            "r",
            SceneDelta::new()
                .upsert(None, Element::new("x", 1))
                .to_payload()
                .unwrap(),
        );

        h.client
            .handle_message(acknowledged(vec![AcknowledgedDelta::from_delta(&remote, 4)]));

        assert_eq!(h.client.last_acknowledged_version(), 0);
        assert_eq!(h.scene.snapshot(), before);
        assert!(matches!(h.sink.faults().as_slice(), [SyncFault::Resync(_)]));
        assert!(h.client.resync_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_is_debounced() {
        let mut h = harness();
        h.client.schedule_resync();
        tokio::time::advance(Duration::from_millis(600)).await;
        h.client.schedule_resync();

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!h.client.poll_resync(Instant::now()));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(h.client.poll_resync(Instant::now()));
        assert!(!h.client.poll_resync(Instant::now()));
        assert_eq!(h.transport.sent(), vec![ClientMessage::pull(0)]);
    }

    #[test]
    fn rejection_drops_reverts_and_reports() {
        let mut h = harness_with(
            MemoryRepository::new(),
            SharedScene::from_elements([Element::new("a", 1)]),
        );
        let d1 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(Some(Element::new("a", 1)), Element::new("a", 2)))
            .unwrap();
        let d2 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(None, Element::new("b", 1)))
            .unwrap();
        h.client.push(Some(d1.clone()));
        h.client.push(Some(d2.clone()));

        h.client.handle_message(ServerMessage::Rejected(Rejection {
            ids: vec![d1.id.clone(), DeltaId::from("unknown")],
            message: "too large".to_string(),
        }));

        assert_eq!(h.client.queued_deltas(), vec![d2.clone()]);
        assert_eq!(h.scene.get("a").map(|e| e.version), Some(1));
        assert!(h.scene.get("b").is_some());
        assert_eq!(
            h.sink.faults(),
            vec![SyncFault::Rejected {
                ids: vec![d1.id.clone()],
                message: "too large".to_string(),
            }]
        );
        assert!(h.client.resync_deadline().is_none());
    }

    #[test]
    fn rejection_keeps_later_queued_edits_to_the_same_element() {
        let mut h = harness_with(
            MemoryRepository::new(),
            SharedScene::from_elements([Element::new("a", 1)]),
        );
        let d1 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(Some(Element::new("a", 1)), Element::new("a", 2)))
            .unwrap();
        let d2 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(Some(Element::new("a", 2)), Element::new("a", 3)))
            .unwrap();
        h.client.push(Some(d1.clone()));
        h.client.push(Some(d2.clone()));

        h.client.handle_message(ServerMessage::Rejected(Rejection {
            ids: vec![d1.id.clone()],
            message: "refused".to_string(),
        }));

        assert_eq!(h.client.queued_deltas(), vec![d2]);
        assert_eq!(h.client.scene().get("a").map(|e| e.version), Some(3));
        assert!(h.client.resync_deadline().is_none());
    }

    #[test]
    fn offline_edits_flush_in_order_when_back_online() {
        let repository = MemoryRepository::new();
        repository
            .save_metadata(
                "room",
                &SyncMetadata {
                    last_acknowledged_version: 5,
                },
            )
            .unwrap();
        let mut h = harness_with(repository, SharedScene::new());
        h.transport.set_state(ConnectionState::Offline);
        assert_eq!(h.client.connection_state(), ConnectionState::Offline);

        let d1 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(None, Element::new("a", 1)))
            .unwrap();
        let d2 = h
            .scene
            .apply_local(&SceneDelta::new().upsert(None, Element::new("b", 1)))
            .unwrap();
        h.client.push(Some(d1.clone()));
        h.client.push(Some(d2.clone()));
        assert!(h.transport.sent().is_empty());

        h.transport.set_state(ConnectionState::Online);
        h.client.handle_event(TransportEvent::Online);

        assert_eq!(
            h.transport.sent(),
            vec![
                ClientMessage::pull(5),
                ClientMessage::Push(d1),
                ClientMessage::Push(d2),
            ]
        );
    }

    #[test]
    fn large_push_is_framed_in_chunks() {
        let mut h = harness();
        h.client.transport().set_max_message_size(16);

        let delta = h
            .scene
            .apply_local(&SceneDelta::new().upsert(
                None,
                Element::new("a", 1).with_property("label", serde_json::json!("long enough to split")),
            ))
            .unwrap();
        h.client.push(Some(delta));

        let frames = h.transport.frames();
        assert!(frames.len() > 1);
        assert!(frames
            .iter()
            .all(|frame| frame.message_type == "push" && frame.chunk_info.is_some()));
    }

    #[test]
    fn relayed_change_merges_newer_elements() {
        let mut h = harness_with(
            MemoryRepository::new(),
            SharedScene::from_elements([Element::new("a", 3), Element::new("b", 1)]),
        );

        h.client.handle_message(ServerMessage::Relayed(Change::from_elements([
            Element::new("a", 2),
            Element::new("b", 2),
            Element::new("c", 1),
        ])));

        assert_eq!(h.scene.get("a").map(|e| e.version), Some(3));
        assert_eq!(h.scene.get("b").map(|e| e.version), Some(2));
        assert_eq!(h.scene.get("c").map(|e| e.version), Some(1));
        assert!(h.client.queued_deltas().is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut h = harness();
        h.client.handle_frame("{not json");
        h.client.handle_frame(r#"{"type":"acknowledged","payload":{"deltas":"nope"}}"#);

        assert_eq!(h.client.last_acknowledged_version(), 0);
        assert!(h.sink.faults().is_empty());
    }

    #[test]
    fn push_while_disconnected_connects() {
        let mut h = harness();
        h.transport.set_state(ConnectionState::Disconnected);

        h.client
            .push(Some(Delta::with_id("d", serde_json::json!({"elements": {}}))));

        assert_eq!(h.transport.connects(), 1);
        assert_eq!(h.client.queued_deltas().len(), 1);
    }
}
