//! In-Memory Transport
//!
//! Sessions are backed by unbounded channels. The owning test (or local
//! harness) pushes frames into live sessions, closes or fails them, and can
//! make the next connects fail to exercise reconnect behavior.
//!
//! Sessions are addressed by a marker: a session matches when its URL or any
//! message it sent contains the marker. For Binance the subscribe message
//! names the stream (`btcusdt@trade`), which makes a convenient marker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::application::ports::{StreamSession, StreamTransport};
use crate::error::MarketDataError;

const ORIGIN: &str = "memory";

enum Inbound {
    Text(String),
    Close,
    Fail(String),
}

struct SessionSlot {
    id: u64,
    url: String,
    sent: Vec<String>,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl SessionSlot {
    fn matches(&self, marker: &str) -> bool {
        self.url.contains(marker) || self.sent.iter().any(|m| m.contains(marker))
    }
}

#[derive(Default)]
struct State {
    next_id: AtomicU64,
    connect_attempts: Mutex<Vec<Instant>>,
    failing_connects: Mutex<u32>,
    connect_delay: Mutex<Option<Duration>>,
    sessions: Mutex<Vec<SessionSlot>>,
    sent: Mutex<Vec<String>>,
}

impl State {
    fn remove(&self, id: u64) {
        self.sessions.lock().retain(|slot| slot.id != id);
    }

    fn push(&self, marker: Option<&str>, make: impl Fn() -> Inbound) -> usize {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .filter(|slot| marker.is_none_or(|m| slot.matches(m)))
            .filter(|slot| slot.tx.send(make()).is_ok())
            .count()
    }
}

/// Scripted [`StreamTransport`]. Clones share the same sessions.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<State>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Create a transport with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connect by `delay`.
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.state.connect_delay.lock() = Some(delay);
        self
    }

    /// Make the next `n` connects fail with a transport error.
    pub fn fail_next_connects(&self, n: u32) {
        *self.state.failing_connects.lock() = n;
    }

    /// Connect attempts so far, including failed ones.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connect_attempts.lock().len()
    }

    /// When each connect attempt started.
    #[must_use]
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.connect_attempts.lock().clone()
    }

    /// Sessions that are open and not yet dropped.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.state.sessions.lock().len()
    }

    /// Every message sent by any session, in order.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Whether an open session matches `marker`.
    #[must_use]
    pub fn has_session(&self, marker: &str) -> bool {
        self.state.sessions.lock().iter().any(|slot| slot.matches(marker))
    }

    /// Wait until a session matching `marker` is open.
    ///
    /// Returns `false` if none appears within `timeout`.
    pub async fn wait_for_session(&self, marker: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_session(marker) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.has_session(marker)
    }

    /// Push a text frame to every open session. Returns how many received it.
    pub fn push_text(&self, text: &str) -> usize {
        self.state.push(None, || Inbound::Text(text.to_string()))
    }

    /// Push a text frame to sessions matching `marker`.
    pub fn push_text_matching(&self, marker: &str, text: &str) -> usize {
        self.state
            .push(Some(marker), || Inbound::Text(text.to_string()))
    }

    /// Close sessions matching `marker` as if the server hung up.
    pub fn close_matching(&self, marker: &str) -> usize {
        self.state.push(Some(marker), || Inbound::Close)
    }

    /// Close every open session as if the server hung up.
    pub fn close_all(&self) -> usize {
        self.state.push(None, || Inbound::Close)
    }

    /// Fail sessions matching `marker` with a transport error.
    pub fn fail_matching(&self, marker: &str, reason: &str) -> usize {
        self.state
            .push(Some(marker), || Inbound::Fail(reason.to_string()))
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, MarketDataError> {
        self.state.connect_attempts.lock().push(Instant::now());

        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failing = self.state.failing_connects.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(MarketDataError::transport(ORIGIN, "connection refused"));
            }
        }

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.sessions.lock().push(SessionSlot {
            id,
            url: url.to_string(),
            sent: Vec::new(),
            tx,
        });

        Ok(Box::new(MemorySession {
            id,
            state: Arc::clone(&self.state),
            rx,
        }))
    }
}

struct MemorySession {
    id: u64,
    state: Arc<State>,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl StreamSession for MemorySession {
    async fn send_text(&mut self, text: String) -> Result<(), MarketDataError> {
        {
            let mut sessions = self.state.sessions.lock();
            let Some(slot) = sessions.iter_mut().find(|slot| slot.id == self.id) else {
                return Err(MarketDataError::transport(ORIGIN, "session closed"));
            };
            slot.sent.push(text.clone());
        }
        self.state.sent.lock().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Result<Option<String>, MarketDataError> {
        match self.rx.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(text)),
            Some(Inbound::Fail(reason)) => Err(MarketDataError::transport(ORIGIN, reason)),
            Some(Inbound::Close) | None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.state.remove(self.id);
        self.rx.close();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.state.remove(self.id);
    }
}
