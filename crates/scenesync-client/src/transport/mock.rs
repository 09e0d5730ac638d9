//! Mock transport for testing.

use super::{ConnectionState, Transport};
use scenesync_proto::{frame_message, ClientMessage, Envelope, MAX_MESSAGE_SIZE};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct MockState {
    state: ConnectionState,
    sent: Vec<ClientMessage>,
    frames: Vec<Envelope>,
    dropped: usize,
    connects: usize,
    disconnects: usize,
    max_message_size: usize,
}

/// In-process transport that records what the client sends.
///
/// Clones share state, so a test keeps one handle while the client owns
/// another. The connection state only changes when the test says so,
/// except that `connect` moves a disconnected mock to `Connecting` and
/// `disconnect` moves any mock to `Disconnected`.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a disconnected mock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                state: ConnectionState::Disconnected,
                sent: Vec::new(),
                frames: Vec::new(),
                dropped: 0,
                connects: 0,
                disconnects: 0,
                max_message_size: MAX_MESSAGE_SIZE,
            })),
        }
    }

    /// Create a mock that is already online.
    #[must_use]
    pub fn online() -> Self {
        let mock = Self::new();
        mock.set_state(ConnectionState::Online);
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Force the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    /// Set the chunking threshold used for recorded frames.
    pub fn set_max_message_size(&self, size: usize) {
        self.lock().max_message_size = size;
    }

    /// Messages that were sent while online.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.lock().sent.clone()
    }

    /// Envelopes produced for the sent messages.
    #[must_use]
    pub fn frames(&self) -> Vec<Envelope> {
        self.lock().frames.clone()
    }

    /// Take and clear the sent messages.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        let mut state = self.lock();
        state.frames.clear();
        std::mem::take(&mut state.sent)
    }

    /// Messages dropped because the mock was not online.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    /// Number of `connect` calls.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Number of `disconnect` calls.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) {
        let mut state = self.lock();
        state.connects += 1;
        if state.state == ConnectionState::Disconnected {
            state.state = ConnectionState::Connecting;
        }
    }

    fn disconnect(&mut self) {
        let mut state = self.lock();
        state.disconnects += 1;
        state.state = ConnectionState::Disconnected;
    }

    fn send(&mut self, message: &ClientMessage) {
        let current = self.lock().state;
        match current {
            ConnectionState::Online => {}
            ConnectionState::Disconnected => {
                self.lock().dropped += 1;
                self.connect();
                return;
            }
            ConnectionState::Connecting | ConnectionState::Offline => {
                self.lock().dropped += 1;
                return;
            }
        }

        let mut state = self.lock();
        match frame_message(message, state.max_message_size) {
            Ok(envelopes) => state.frames.extend(envelopes),
            Err(err) => tracing::warn!(error = %err, "Mock failed to frame message"),
        }
        state.sent.push(message.clone());
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_while_online() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();

        transport.send(&ClientMessage::pull(0));
        assert_eq!(mock.state(), ConnectionState::Connecting);
        assert_eq!(mock.connects(), 1);

        transport.send(&ClientMessage::pull(0));
        assert_eq!(mock.dropped(), 2);

        mock.set_state(ConnectionState::Online);
        transport.send(&ClientMessage::pull(3));
        assert_eq!(mock.sent(), vec![ClientMessage::pull(3)]);
        assert_eq!(mock.frames().len(), 1);

        mock.set_state(ConnectionState::Offline);
        transport.send(&ClientMessage::pull(4));
        assert_eq!(mock.sent().len(), 1);

        transport.disconnect();
        assert_eq!(mock.state(), ConnectionState::Disconnected);
    }
}
