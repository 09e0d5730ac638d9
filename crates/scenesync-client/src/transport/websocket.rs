//! Reconnecting WebSocket transport.

use super::{ConnectionState, Transport, TransportConfig, TransportEvent};
use crate::config::ReconnectConfig;
use futures_util::{SinkExt, StreamExt};
use scenesync_proto::{frame_message, ClientMessage, RoomAddress};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Flags shared with the tasks of one connection.
#[derive(Debug)]
struct LinkState {
    open: AtomicBool,
    reachable: AtomicBool,
}

impl LinkState {
    fn new(reachable: bool) -> Self {
        Self {
            open: AtomicBool::new(false),
            reachable: AtomicBool::new(reachable),
        }
    }
}

/// Live tasks of one connection.
#[derive(Debug)]
struct Link {
    state: Arc<LinkState>,
    outbound: mpsc::UnboundedSender<String>,
    socket_task: JoinHandle<()>,
    reachability_task: Option<JoinHandle<()>>,
}

impl Link {
    fn abort(self) {
        self.socket_task.abort();
        if let Some(task) = self.reachability_task {
            task.abort();
        }
    }
}

/// WebSocket transport with backoff, connect throttling and chunked sends.
///
/// `connect` spawns tasks, so it must be called from within a Tokio runtime.
#[derive(Debug)]
pub struct WebSocketTransport {
    address: RoomAddress,
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    reachability: Option<watch::Receiver<bool>>,
    link: Option<Link>,
    last_connect: Option<Instant>,
}

impl WebSocketTransport {
    /// Create a transport for `address`, reporting on `events`.
    #[must_use]
    pub fn new(
        address: RoomAddress,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            address,
            config,
            events,
            reachability: None,
            link: None,
            last_connect: None,
        }
    }

    /// Follow a host-provided reachability signal (`true` = online).
    #[must_use]
    pub fn with_reachability(mut self, reachability: watch::Receiver<bool>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    /// The room this transport connects to.
    #[must_use]
    pub fn address(&self) -> &RoomAddress {
        &self.address
    }

    fn teardown(&mut self) -> bool {
        match self.link.take() {
            Some(link) => {
                link.abort();
                true
            }
            None => false,
        }
    }

    fn throttled(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_connect {
            if now.duration_since(last) < self.config.connect_throttle {
                return true;
            }
        }
        self.last_connect = Some(now);
        false
    }
}

impl Transport for WebSocketTransport {
    fn connect(&mut self) {
        if self.throttled() {
            tracing::trace!(room_id = %self.address.room_id(), "Connect throttled");
            return;
        }

        match self.state() {
            ConnectionState::Online => return,
            ConnectionState::Disconnected => {}
            state => {
                tracing::debug!(room_id = %self.address.room_id(), %state, "Replacing existing connection");
                self.teardown();
            }
        }

        let reachable = self
            .reachability
            .as_ref()
            .map_or(true, |signal| *signal.borrow());
        let state = Arc::new(LinkState::new(reachable));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let socket_task = tokio::spawn(run_socket(
            self.address.connect_url(),
            self.config.reconnect.clone(),
            Arc::clone(&state),
            outbound_rx,
            self.events.clone(),
        ));

        let reachability_task = self.reachability.clone().map(|signal| {
            tokio::spawn(watch_reachability(
                signal,
                Arc::clone(&state),
                self.events.clone(),
            ))
        });

        tracing::info!(room_id = %self.address.room_id(), url = %self.address.connect_url(), "Connecting");

        self.link = Some(Link {
            state,
            outbound: outbound_tx,
            socket_task,
            reachability_task,
        });
    }

    fn disconnect(&mut self) {
        if self.teardown() {
            tracing::info!(room_id = %self.address.room_id(), "Disconnected");
        }
    }

    fn send(&mut self, message: &ClientMessage) {
        let message_type = message.message_type();

        match self.state() {
            ConnectionState::Online => {}
            ConnectionState::Disconnected => {
                tracing::debug!(%message_type, "Not connected, connecting instead of sending");
                self.connect();
                return;
            }
            state => {
                tracing::trace!(%message_type, %state, "Dropped message while not online");
                return;
            }
        }

        let envelopes = match frame_message(message, self.config.max_message_size) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                tracing::warn!(error = %err, %message_type, "Failed to frame message");
                return;
            }
        };

        let Some(link) = self.link.as_ref() else {
            return;
        };

        for envelope in envelopes {
            let frame = match envelope.to_json() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, %message_type, "Failed to encode envelope");
                    return;
                }
            };

            tracing::trace!(%message_type, payload_len = frame.len(), "Sending frame");
            if link.outbound.send(frame).is_err() {
                tracing::warn!(%message_type, "Socket task stopped, message dropped");
                return;
            }
        }
    }

    fn state(&self) -> ConnectionState {
        let Some(link) = self.link.as_ref() else {
            return ConnectionState::Disconnected;
        };

        if link.socket_task.is_finished() {
            ConnectionState::Disconnected
        } else if !link.state.open.load(Ordering::Acquire) {
            ConnectionState::Connecting
        } else if link.state.reachable.load(Ordering::Acquire) {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Drop frames queued while the socket is not open.
fn discard_pending(outbound: &mut mpsc::UnboundedReceiver<String>) -> bool {
    loop {
        match outbound.try_recv() {
            Ok(_) => tracing::trace!("Dropped frame while disconnected"),
            Err(mpsc::error::TryRecvError::Empty) => return true,
            Err(mpsc::error::TryRecvError::Disconnected) => return false,
        }
    }
}

async fn run_socket(
    url: Url,
    reconnect: ReconnectConfig,
    state: Arc<LinkState>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            if !reconnect.allows_attempt(attempt) {
                tracing::warn!(attempt, "Max reconnect attempts reached");
                return;
            }

            let delay = reconnect.delay_for_attempt(attempt);
            tracing::info!(attempt, ?delay, "Reconnecting");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    frame = outbound.recv() => {
                        if frame.is_none() {
                            return;
                        }
                        tracing::trace!("Dropped frame while disconnected");
                    }
                }
            }
        }

        if !discard_pending(&mut outbound) {
            return;
        }

        let stream = match tokio::time::timeout(
            reconnect.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, %url, attempt, "Connection failed");
                attempt = attempt.saturating_add(1);
                continue;
            }
            Err(_) => {
                tracing::warn!(%url, attempt, timeout = ?reconnect.connect_timeout, "Connection timed out");
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        let opened = Instant::now();
        state.open.store(true, Ordering::Release);
        tracing::info!(%url, "Connected");
        if events.send(TransportEvent::Open).is_err() {
            return;
        }

        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        let _ = write.close().await;
                        state.open.store(false, Ordering::Release);
                        return;
                    };
                    if let Err(err) = write.send(Message::Text(frame)).await {
                        tracing::warn!(error = %err, "Failed to send frame");
                        break;
                    }
                }

                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if events.send(TransportEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                if events.send(TransportEvent::Message(text)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => tracing::warn!(error = %err, "Dropped non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server closed connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "WebSocket error");
                            break;
                        }
                        None => {
                            tracing::info!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        state.open.store(false, Ordering::Release);
        if events.send(TransportEvent::Closed).is_err() {
            return;
        }

        attempt = if opened.elapsed() >= reconnect.min_uptime {
            1
        } else {
            attempt.saturating_add(1).max(1)
        };
    }
}

async fn watch_reachability(
    mut signal: watch::Receiver<bool>,
    state: Arc<LinkState>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while signal.changed().await.is_ok() {
        let reachable = *signal.borrow_and_update();
        let was_reachable = state.reachable.swap(reachable, Ordering::AcqRel);

        if reachable == was_reachable {
            continue;
        }

        if reachable {
            tracing::info!("Network reachable");
            if state.open.load(Ordering::Acquire) && events.send(TransportEvent::Online).is_err() {
                return;
            }
        } else {
            tracing::info!("Network unreachable, pausing sends");
        }
    }
}
