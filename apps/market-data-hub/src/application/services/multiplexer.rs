//! Stream Multiplexer
//!
//! Owns at most one physical upstream connection per channel key and fans
//! each connection's events out to every registered subscriber.
//!
//! # Lifecycle
//!
//! - `subscribe` registers a callback and lazily starts the channel's worker.
//!   It never waits on the network; connection progress and failures reach
//!   the subscriber through its callback.
//! - `unsubscribe` is idempotent. When the last subscriber leaves, teardown
//!   is scheduled after a grace period. A resubscribe inside the grace period
//!   cancels the teardown and reuses the live connection.
//! - One worker task per live channel drives connect, read, deliver and
//!   reconnect. Workers are children of the multiplexer's shutdown token.
//!
//! # Delivery
//!
//! Events are delivered to subscribers in arrival order. The worker copies
//! the subscriber list before delivering, so no lock is held while callbacks
//! run and callbacks may unsubscribe themselves. Each callback gets a fixed
//! timeout; a callback that overruns misses that message and delivery moves
//! on to the next subscriber.
//!
//! # Failures
//!
//! - Unparseable frames are logged and dropped.
//! - Transport failures trigger exponential backoff, without an attempt
//!   limit while subscribers remain.
//! - An explicit upstream rejection is delivered once to every subscriber
//!   and the channel is marked failed until the next `subscribe`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{Decoded, StreamProvider, StreamSession, StreamTransport};
use crate::domain::channel::{ChannelKey, ConnectionState};
use crate::domain::market::MarketEvent;
use crate::domain::symbol::Provider;
use crate::error::MarketDataError;
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration
// =============================================================================

/// Multiplexer timing configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// How long an idle channel stays open after its last unsubscribe.
    pub grace_period: Duration,
    /// Maximum time a single callback may take per message.
    pub callback_timeout: Duration,
    /// Uptime after which a connection counts as stable and backoff resets.
    pub stabilization_window: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            callback_timeout: Duration::from_millis(250),
            stabilization_window: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// =============================================================================
// Messages and Callbacks
// =============================================================================

/// Message delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// A normalized market event.
    Event(Arc<MarketEvent>),
    /// A terminal channel error (delivered once).
    Error(MarketDataError),
}

/// Subscriber callback. The returned future is awaited under the callback
/// timeout.
pub type MessageCallback = Arc<dyn Fn(ChannelMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap a synchronous closure as a subscriber callback.
///
/// The closure runs to completion before the delivery timeout is armed, so
/// the timeout cannot interrupt it. Closures that may block or take long
/// belong in `async_callback`.
pub fn callback<F>(f: F) -> MessageCallback
where
    F: Fn(ChannelMessage) + Send + Sync + 'static,
{
    Arc::new(move |message| {
        f(message);
        futures::future::ready(()).boxed()
    })
}

/// Wrap an asynchronous closure as a subscriber callback.
pub fn async_callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(ChannelMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Opaque token for one registered callback.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    key: ChannelKey,
    alive: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// Unique subscription id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Channel this handle is registered on.
    #[must_use]
    pub const fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Whether the handle is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Point-in-time view of one channel, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    /// Channel key.
    pub channel: String,
    /// Connection state.
    #[serde(flatten)]
    pub state: ConnectionState,
    /// Registered subscribers.
    pub subscribers: usize,
    /// Events received since the channel was created.
    pub messages_received: u64,
    /// Reconnect attempts since the channel was created.
    pub reconnects: u64,
    /// Most recent connection error.
    pub last_error: Option<String>,
}

// =============================================================================
// Channel State
// =============================================================================

#[derive(Clone)]
struct Subscriber {
    id: u64,
    callback: MessageCallback,
    alive: Arc<AtomicBool>,
}

struct Worker {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Channel worker panicked");
        }
    }
}

struct ChannelInner {
    subscribers: Vec<Subscriber>,
    state: ConnectionState,
    worker: Option<Worker>,
    linger: Option<CancellationToken>,
    retired: bool,
    generation: u64,
    messages_received: u64,
    reconnects: u64,
    last_error: Option<String>,
}

struct Channel {
    key: ChannelKey,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    const fn new(key: ChannelKey) -> Self {
        Self {
            key,
            inner: Mutex::new(ChannelInner {
                subscribers: Vec::new(),
                state: ConnectionState::Disconnected,
                worker: None,
                linger: None,
                retired: false,
                generation: 0,
                messages_received: 0,
                reconnects: 0,
                last_error: None,
            }),
        }
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        self.inner.lock().subscribers.clone()
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && !inner.retired {
            inner.state = state;
        }
    }

    fn record_message(&self) {
        self.inner.lock().messages_received += 1;
    }

    fn record_failure(&self, generation: u64, error: &MarketDataError, attempt: u32) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && !inner.retired {
            inner.state = ConnectionState::Backoff { attempt };
            inner.reconnects += 1;
            inner.last_error = Some(error.to_string());
        }
    }

    /// Called by a worker on exit. Only the current generation may clear
    /// the worker slot.
    fn finish(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if !inner.retired {
            inner.state = ConnectionState::Disconnected;
        }
        if inner
            .worker
            .as_ref()
            .is_some_and(|w| w.generation == generation)
        {
            inner.worker = None;
        }
    }

    /// Mark the channel terminally failed and release the worker slot in
    /// one step, returning the subscribers the error is owed to.
    ///
    /// A `subscribe` racing with the error delivery either lands in the
    /// returned list or finds no worker and restarts the channel.
    fn fail(&self, generation: u64, error: &MarketDataError) -> Vec<Subscriber> {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.retired {
            return Vec::new();
        }
        inner.state = ConnectionState::Failed;
        inner.last_error = Some(error.to_string());
        if inner
            .worker
            .as_ref()
            .is_some_and(|w| w.generation == generation)
        {
            inner.worker = None;
        }
        inner.subscribers.clone()
    }

    fn status(&self) -> ChannelStatus {
        let inner = self.inner.lock();
        ChannelStatus {
            channel: self.key.to_string(),
            state: inner.state,
            subscribers: inner.subscribers.len(),
            messages_received: inner.messages_received,
            reconnects: inner.reconnects,
            last_error: inner.last_error.clone(),
        }
    }
}

struct Shared {
    providers: HashMap<Provider, Arc<dyn StreamProvider>>,
    transport: Arc<dyn StreamTransport>,
    config: MultiplexerConfig,
    channels: RwLock<HashMap<ChannelKey, Arc<Channel>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn provider(&self, key: &ChannelKey) -> Result<Arc<dyn StreamProvider>, MarketDataError> {
        self.providers
            .get(&key.provider)
            .cloned()
            .ok_or_else(|| MarketDataError::UnsupportedSymbol {
                provider: key.provider,
                symbol: key.symbol.to_string(),
            })
    }

    fn channel_entry(&self, key: &ChannelKey) -> Arc<Channel> {
        if let Some(channel) = self.channels.read().get(key) {
            return Arc::clone(channel);
        }
        let mut channels = self.channels.write();
        let channel = Arc::clone(
            channels
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Channel::new(key.clone()))),
        );
        metrics::set_live_channels(channels.len());
        channel
    }

    async fn open_session(
        &self,
        key: &ChannelKey,
    ) -> Result<Box<dyn StreamSession>, MarketDataError> {
        let provider = self.provider(key)?;
        let url = provider.endpoint(key)?;
        tracing::debug!(channel = %key, url = %url, "Connecting channel");

        let mut session = self.transport.connect(&url).await?;
        if let Some(message) = provider.subscribe_message(key)?
            && let Err(e) = session.send_text(message).await
        {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Tear down a channel whose grace period elapsed.
    async fn retire(&self, channel: &Arc<Channel>, linger: &CancellationToken) {
        let worker = {
            let mut channels = self.channels.write();
            let mut inner = channel.inner.lock();
            if linger.is_cancelled() || inner.retired || !inner.subscribers.is_empty() {
                return;
            }
            inner.retired = true;
            inner.linger = None;
            inner.state = ConnectionState::Disconnected;
            if channels
                .get(&channel.key)
                .is_some_and(|c| Arc::ptr_eq(c, channel))
            {
                channels.remove(&channel.key);
            }
            metrics::set_live_channels(channels.len());
            inner.worker.take()
        };

        tracing::info!(channel = %channel.key, "Grace period elapsed, closing channel");
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }
}

// =============================================================================
// Stream Multiplexer
// =============================================================================

/// Multiplexes upstream stream connections across in-process subscribers.
///
/// Cheap to clone; clones share the same channels.
#[derive(Clone)]
pub struct StreamMultiplexer {
    shared: Arc<Shared>,
}

impl StreamMultiplexer {
    /// Create a multiplexer over the given stream providers and transport.
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn StreamProvider>>,
        transport: Arc<dyn StreamTransport>,
        config: MultiplexerConfig,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| (provider.provider(), provider))
            .collect();
        Self {
            shared: Arc::new(Shared {
                providers,
                transport,
                config,
                channels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a callback on a channel, starting the channel if needed.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if the channel cannot be mapped to the
    /// provider, or `ShuttingDown` after `shutdown` was called.
    pub fn subscribe(
        &self,
        key: ChannelKey,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, MarketDataError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(MarketDataError::ShuttingDown);
        }
        let provider = self.shared.provider(&key)?;
        provider.endpoint(&key)?;
        provider.subscribe_message(&key)?;

        let subscriber = Subscriber {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            callback,
            alive: Arc::new(AtomicBool::new(true)),
        };
        let handle = SubscriptionHandle {
            id: subscriber.id,
            key: key.clone(),
            alive: Arc::clone(&subscriber.alive),
        };

        loop {
            if self.shared.shutdown.is_cancelled() {
                return Err(MarketDataError::ShuttingDown);
            }
            let channel = self.shared.channel_entry(&key);
            let mut inner = channel.inner.lock();
            if inner.retired {
                // Lost a race with teardown; the next lookup creates a new channel.
                continue;
            }

            inner.subscribers.push(subscriber.clone());
            metrics::increment_subscribers();

            if let Some(linger) = inner.linger.take() {
                linger.cancel();
                tracing::debug!(channel = %key, "Resubscribed within grace period, reusing connection");
            }
            if inner.worker.is_none() {
                spawn_worker(&self.shared, &channel, &mut inner);
            }

            tracing::debug!(
                channel = %key,
                subscription_id = handle.id,
                subscribers = inner.subscribers.len(),
                "Subscribed"
            );
            break;
        }

        Ok(handle)
    }

    /// Remove a subscription. Safe to call repeatedly and from inside a
    /// delivery callback.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if !handle.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(channel) = self.shared.channels.read().get(&handle.key).cloned() else {
            return;
        };

        let mut inner = channel.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != handle.id);
        if inner.subscribers.len() < before {
            metrics::decrement_subscribers();
        }
        tracing::debug!(
            channel = %handle.key,
            subscription_id = handle.id,
            subscribers = inner.subscribers.len(),
            "Unsubscribed"
        );

        if inner.subscribers.is_empty() && inner.linger.is_none() && !inner.retired {
            let linger = self.shared.shutdown.child_token();
            inner.linger = Some(linger.clone());
            let shared = Arc::clone(&self.shared);
            let channel = Arc::clone(&channel);
            let grace = self.shared.config.grace_period;
            tokio::spawn(async move {
                tokio::select! {
                    () = linger.cancelled() => {}
                    () = tokio::time::sleep(grace) => {
                        shared.retire(&channel, &linger).await;
                    }
                }
            });
        }
    }

    /// Connection state of a channel, if it exists.
    #[must_use]
    pub fn connection_state(&self, key: &ChannelKey) -> Option<ConnectionState> {
        self.shared
            .channels
            .read()
            .get(key)
            .map(|channel| channel.inner.lock().state)
    }

    /// Registered subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.shared
            .channels
            .read()
            .get(key)
            .map_or(0, |channel| channel.inner.lock().subscribers.len())
    }

    /// Channels currently held open (including those in their grace period).
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.shared.channels.read().len()
    }

    /// Status of every channel, ordered by key.
    #[must_use]
    pub fn channel_statuses(&self) -> Vec<ChannelStatus> {
        let channels: Vec<Arc<Channel>> = self.shared.channels.read().values().cloned().collect();
        let mut statuses: Vec<ChannelStatus> = channels.iter().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.channel.cmp(&b.channel));
        statuses
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Close every connection, release every handle and wait for all
    /// workers to exit.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let channels: Vec<Arc<Channel>> = self
            .shared
            .channels
            .write()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        metrics::set_live_channels(0);

        let mut workers = Vec::new();
        for channel in &channels {
            let mut inner = channel.inner.lock();
            inner.retired = true;
            inner.linger = None;
            inner.state = ConnectionState::Disconnected;
            for subscriber in inner.subscribers.drain(..) {
                subscriber.alive.store(false, Ordering::Release);
                metrics::decrement_subscribers();
            }
            if let Some(worker) = inner.worker.take() {
                workers.push(worker);
            }
        }

        for worker in workers {
            worker.stop().await;
        }
        tracing::info!(channels = channels.len(), "Stream multiplexer stopped");
    }
}

// =============================================================================
// Channel Worker
// =============================================================================

enum SessionEnd {
    Cancelled,
    Failed(MarketDataError),
}

fn spawn_worker(shared: &Arc<Shared>, channel: &Arc<Channel>, inner: &mut ChannelInner) {
    inner.generation += 1;
    inner.state = ConnectionState::Connecting;
    let generation = inner.generation;
    let cancel = shared.shutdown.child_token();
    let handle = tokio::spawn(run_channel(
        Arc::clone(shared),
        Arc::clone(channel),
        cancel.clone(),
        generation,
    ));
    inner.worker = Some(Worker {
        generation,
        cancel,
        handle,
    });
}

async fn run_channel(
    shared: Arc<Shared>,
    channel: Arc<Channel>,
    cancel: CancellationToken,
    generation: u64,
) {
    let key = channel.key.clone();
    let mut policy = ReconnectPolicy::new(shared.config.reconnect.clone());

    loop {
        channel.set_state(generation, ConnectionState::Connecting);

        let opened = tokio::select! {
            () = cancel.cancelled() => break,
            opened = shared.open_session(&key) => opened,
        };

        let failure = match opened {
            Ok(mut session) => {
                channel.set_state(generation, ConnectionState::Connected);
                tracing::info!(channel = %key, "Channel connected");

                let connected_at = Instant::now();
                let end = pump(&shared, &channel, session.as_mut(), &cancel).await;
                session.close().await;

                if connected_at.elapsed() >= shared.config.stabilization_window {
                    policy.reset();
                }
                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Failed(e) => e,
                }
            }
            Err(e) => e,
        };

        if !failure.is_retryable() {
            tracing::error!(channel = %key, error = %failure, "Channel failed, not retrying");
            let owed = channel.fail(generation, &failure);
            deliver_to(&shared, &channel.key, owed, &ChannelMessage::Error(failure)).await;
            return;
        }

        let delay = policy.next_delay();
        let attempt = policy.attempt_count();
        channel.record_failure(generation, &failure, attempt);
        metrics::record_reconnect(key.provider);
        tracing::warn!(
            channel = %key,
            error = %failure,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Channel connection lost, reconnecting"
        );

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    channel.finish(generation);
    tracing::debug!(channel = %key, "Channel worker stopped");
}

async fn pump(
    shared: &Shared,
    channel: &Channel,
    session: &mut dyn StreamSession,
    cancel: &CancellationToken,
) -> SessionEnd {
    let key = &channel.key;
    let provider = match shared.provider(key) {
        Ok(provider) => provider,
        Err(e) => return SessionEnd::Failed(e),
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return SessionEnd::Cancelled,
            next = session.next_text() => next,
        };

        let text = match next {
            Ok(Some(text)) => text,
            Ok(None) => {
                return SessionEnd::Failed(MarketDataError::transport(
                    key.provider.as_str(),
                    "connection closed by peer",
                ));
            }
            Err(e) => return SessionEnd::Failed(e),
        };

        match provider.decode(key, &text) {
            Ok(Decoded::Event(event)) => {
                channel.record_message();
                metrics::record_message_received(key.provider, key.kind);
                deliver(shared, channel, &ChannelMessage::Event(Arc::new(event))).await;
            }
            Ok(Decoded::Control) => {
                tracing::trace!(channel = %key, "Control frame");
            }
            Ok(Decoded::Rejected(reason)) => {
                return SessionEnd::Failed(MarketDataError::UpstreamRejected {
                    provider: key.provider,
                    target: key.to_string(),
                    reason,
                });
            }
            Err(e) => {
                metrics::record_message_dropped(DropReason::ParseFailure);
                tracing::warn!(channel = %key, error = %e, "Dropping unparseable message");
            }
        }
    }
}

async fn deliver(shared: &Shared, channel: &Channel, message: &ChannelMessage) {
    deliver_to(shared, &channel.key, channel.subscribers(), message).await;
}

async fn deliver_to(
    shared: &Shared,
    key: &ChannelKey,
    subscribers: Vec<Subscriber>,
    message: &ChannelMessage,
) {
    let timeout = shared.config.callback_timeout;
    for subscriber in subscribers {
        if !subscriber.alive.load(Ordering::Acquire) {
            continue;
        }
        let started = Instant::now();
        let delivery = (subscriber.callback)(message.clone());
        if tokio::time::timeout(timeout, delivery).await.is_err() {
            metrics::record_message_dropped(DropReason::CallbackTimeout);
            tracing::warn!(
                channel = %key,
                subscription_id = subscriber.id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Subscriber callback timed out, message dropped for subscriber"
            );
        } else {
            metrics::record_delivery_duration(started.elapsed());
        }
    }
}
