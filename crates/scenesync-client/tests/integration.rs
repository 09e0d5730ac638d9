use futures_util::{SinkExt, StreamExt};
use scenesync_client::{
    ReconnectConfig, SyncClient, SyncHandle, SyncOptions, SyncSession, TransportConfig,
    WebSocketTransport,
};
use scenesync_core::{
    AcknowledgedDelta, Delta, DeltasRepository, Element, MemoryRepository, MetadataRepository,
    SceneDelta, SharedScene, TracingErrorSink,
};
use scenesync_proto::{split_payload, Acknowledgement, ClientMessage, Envelope, MessageType, RoomAddress};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const ROOM: &str = "integration";
const SERVER_CHUNK: usize = 48;

type Client = SyncClient<WebSocketTransport, SharedScene, MemoryRepository>;

/// Minimal room server: versions pushes, answers pulls, chunks replies.
struct FakeRoom {
    log: Vec<AcknowledgedDelta>,
    received: mpsc::UnboundedSender<Envelope>,
}

impl FakeRoom {
    async fn serve(&mut self, mut ws: WebSocketStream<TcpStream>) {
        let mut chunks: HashMap<String, Vec<Option<String>>> = HashMap::new();

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else {
                continue;
            };
            let envelope: Envelope = serde_json::from_str(&text).unwrap();
            let _ = self.received.send(envelope.clone());

            let payload = match &envelope.chunk_info {
                None => envelope.payload.clone(),
                Some(info) => {
                    let parts = chunks
                        .entry(info.id.clone())
                        .or_insert_with(|| vec![None; info.count]);
                    parts[info.position] = Some(envelope.payload.clone());
                    if parts.iter().any(Option::is_none) {
                        continue;
                    }
                    chunks.remove(&info.id).unwrap().into_iter().flatten().collect()
                }
            };

            let message = ClientMessage::from_parts(
                &envelope.message_type,
                serde_json::from_str(&payload).unwrap(),
            )
            .unwrap();

            let reply = match message {
                ClientMessage::Pull(request) => Acknowledgement {
                    deltas: self
                        .log
                        .iter()
                        .filter(|delta| delta.version > request.last_acknowledged_version)
                        .cloned()
                        .collect(),
                },
                ClientMessage::Push(delta) => {
                    if !self.log.iter().any(|known| known.id == delta.id) {
                        let version = self.log.len() as u64 + 1;
                        self.log.push(AcknowledgedDelta::from_delta(&delta, version));
                    }
                    Acknowledgement {
                        deltas: self
                            .log
                            .iter()
                            .filter(|known| known.id == delta.id)
                            .cloned()
                            .collect(),
                    }
                }
                ClientMessage::Relay(_) => continue,
            };

            let payload = serde_json::to_string(&reply).unwrap();
            for envelope in split_payload(MessageType::Acknowledged, &payload, SERVER_CHUNK) {
                if ws
                    .send(Message::Text(envelope.to_json().unwrap()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn spawn_server(
    seed: Vec<AcknowledgedDelta>,
    drop_first: bool,
) -> (String, mpsc::UnboundedReceiver<Envelope>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received, frames) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut room = FakeRoom {
            log: seed,
            received,
        };
        let mut connections = 0;

        while let Ok((stream, _)) = listener.accept().await {
            connections += 1;
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            if drop_first && connections == 1 {
                let _ = ws.close(None).await;
                continue;
            }
            room.serve(ws).await;
        }
    });

    (format!("ws://{addr}"), frames)
}

struct Running {
    task: JoinHandle<Client>,
    handle: SyncHandle,
    repository: MemoryRepository,
    scene: SharedScene,
}

fn start_client(
    host: &str,
    max_message_size: usize,
    reachability: Option<watch::Receiver<bool>>,
) -> Running {
    let address = RoomAddress::new(host, ROOM).unwrap();
    let config = TransportConfig {
        max_message_size,
        connect_throttle: Duration::ZERO,
        reconnect: ReconnectConfig {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            ..ReconnectConfig::default()
        },
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut transport = WebSocketTransport::new(address, config, events_tx);
    if let Some(reachability) = reachability {
        transport = transport.with_reachability(reachability);
    }

    let repository = MemoryRepository::new();
    let scene = SharedScene::new();
    let client = SyncClient::create(
        ROOM,
        transport,
        scene.clone(),
        repository.clone(),
        SyncOptions::default(),
        Box::new(TracingErrorSink),
    )
    .unwrap();

    let (session, handle) = SyncSession::new(client, events_rx);
    let task = tokio::spawn(session.run());

    Running {
        task,
        handle,
        repository,
        scene,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn acknowledged_version(repository: &MemoryRepository) -> u64 {
    repository
        .load_metadata(ROOM)
        .unwrap()
        .map_or(0, |metadata| metadata.last_acknowledged_version)
}

fn remote_delta(element: &str) -> Delta {
    let payload = SceneDelta::new()
        .upsert(None, Element::new(element, 1))
        .to_payload()
        .unwrap();
    Delta::with_id(format!("remote-{element}"), payload)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_is_acknowledged_over_chunked_frames() {
    let seed = vec![AcknowledgedDelta::from_delta(&remote_delta("theirs"), 1)];
    let (host, mut frames) = spawn_server(seed, false).await;
    let running = start_client(&host, 64, None);

    running.handle.connect().unwrap();

    let local = running
        .scene
        .apply_local(&SceneDelta::new().upsert(
            None,
            Element::new("mine", 1).with_property("label", serde_json::json!("a fairly long label")),
        ))
        .unwrap();
    running.handle.push(Some(local.clone())).unwrap();

    let repository = running.repository.clone();
    wait_until(|| {
        acknowledged_version(&repository) == 2 && repository.load_deltas(ROOM).unwrap().is_empty()
    })
    .await;

    assert!(running.scene.get("theirs").is_some());
    assert!(running.scene.get("mine").is_some());

    running.handle.dispose().unwrap();
    let client = running.task.await.unwrap();
    assert_eq!(client.last_acknowledged_version(), 2);
    assert_eq!(client.acknowledged_deltas().count(), 2);

    let mut saw_chunked_push = false;
    while let Ok(envelope) = frames.try_recv() {
        if envelope.message_type == "push" && envelope.chunk_info.is_some() {
            saw_chunked_push = true;
        }
    }
    assert!(saw_chunked_push);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_after_server_drops_connection() {
    let (host, _frames) = spawn_server(Vec::new(), true).await;
    let running = start_client(&host, 800_000, None);

    running.handle.connect().unwrap();
    running
        .handle
        .push(Some(Delta::with_id("d1", serde_json::json!({"elements": {}}))))
        .unwrap();

    let repository = running.repository.clone();
    wait_until(|| acknowledged_version(&repository) == 1).await;
    assert!(repository.load_deltas(ROOM).unwrap().is_empty());

    running.handle.dispose().unwrap();
    running.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_edits_flush_when_back_online() {
    let (host, mut frames) = spawn_server(Vec::new(), false).await;
    let (online_tx, online_rx) = watch::channel(false);
    let running = start_client(&host, 800_000, Some(online_rx));

    running.handle.connect().unwrap();

    // Socket opens while offline; the initial catch-up is dropped
    let first = timeout(Duration::from_millis(500), frames.recv()).await;
    assert!(first.is_err(), "nothing should be sent while offline");

    running
        .handle
        .push(Some(Delta::with_id("offline-1", serde_json::json!({"elements": {}}))))
        .unwrap();
    running
        .handle
        .push(Some(Delta::with_id("offline-2", serde_json::json!({"elements": {}}))))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(running.repository.load_deltas(ROOM).unwrap().len(), 2);

    online_tx.send(true).unwrap();

    let repository = running.repository.clone();
    wait_until(|| acknowledged_version(&repository) == 2).await;
    assert!(repository.load_deltas(ROOM).unwrap().is_empty());

    running.handle.dispose().unwrap();
    running.task.await.unwrap();
}
