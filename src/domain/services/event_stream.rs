#[cfg(test)]
#[path = "event_stream_test.rs"]
mod tests;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;
use std::hash::Hasher;
use std::panic;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use futures::FutureExt;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::now_millis;
use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::Envelope;
use crate::domain::models::EventConnection;
use crate::domain::models::EventSourceBox;
use crate::domain::models::ServerEvent;

/// Events seen within the same window are candidates for duplicate
/// suppression.
const DEDUP_WINDOW_MS: i64 = 1000;
const DEDUP_CAPACITY: usize = 1000;

/// Listens to every event type.
pub const WILDCARD: &str = "*";
/// Kind under which [`ServerEvent::Reconnected`] is delivered.
pub const RECONNECTED: &str = "stream.reconnected";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Event stream disconnected: {0}")]
    Disconnected(String),
    #[error("Event stream gave up reconnecting after {0} attempts")]
    GaveUp(u32),
}

/// Exponential reconnect delays: `base * 2^n`, capped at `max`, with at
/// most `max_attempts` delays handed out before giving up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Backoff {
        return Backoff {
            base,
            max,
            max_attempts,
            attempt: 0,
        };
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let factor = 2_u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max);
        self.attempt += 1;

        return Some(delay.min(self.max));
    }

    pub fn attempts(&self) -> u32 {
        return self.attempt;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Bounded set of recently delivered event keys. On overflow the oldest
/// half is discarded.
#[derive(Debug)]
pub struct RecentEvents {
    capacity: usize,
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> RecentEvents {
        return RecentEvents {
            capacity: capacity.max(2),
            order: VecDeque::new(),
            seen: HashSet::new(),
        };
    }

    /// Key for an event: its type, the most specific id it carries, the
    /// arrival window and the full payload. Hashing the payload means two
    /// distinct updates to the same part never collide.
    pub fn key(envelope: &Envelope, raw: &Value, arrived_at: i64) -> u64 {
        let mut hasher = DefaultHasher::new();
        envelope.kind.hash(&mut hasher);
        envelope.identity().hash(&mut hasher);
        (arrived_at / DEDUP_WINDOW_MS).hash(&mut hasher);
        raw.to_string().hash(&mut hasher);

        return hasher.finish();
    }

    /// Records the key, returning false if it was already present.
    pub fn insert(&mut self, key: u64) -> bool {
        if !self.seen.insert(key) {
            return false;
        }

        self.order.push_back(key);
        if self.order.len() > self.capacity {
            let drop_count = self.order.len() / 2;
            for old in self.order.drain(..drop_count) {
                self.seen.remove(&old);
            }
        }

        return true;
    }

    pub fn len(&self) -> usize {
        return self.order.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.order.is_empty();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Sse,
    Poll { interval: Duration, batch_size: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub transport: Transport,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub heartbeat: Duration,
}

fn config_millis(key: ConfigKey) -> Duration {
    return Duration::from_millis(Config::get_number(key));
}

impl StreamConfig {
    pub fn from_config() -> StreamConfig {
        let transport = if Config::get(ConfigKey::Transport) == "poll" {
            Transport::Poll {
                interval: config_millis(ConfigKey::PollInterval),
                batch_size: Config::get_number(ConfigKey::PollBatchSize) as usize,
            }
        } else {
            Transport::Sse
        };

        return StreamConfig {
            transport,
            base_delay: config_millis(ConfigKey::ReconnectBaseDelay),
            max_delay: config_millis(ConfigKey::ReconnectMaxDelay),
            max_attempts: Config::get_number(ConfigKey::ReconnectMaxAttempts) as u32,
            heartbeat: config_millis(ConfigKey::HeartbeatInterval),
        };
    }

    pub fn backoff(&self) -> Backoff {
        return Backoff::new(self.base_delay, self.max_delay, self.max_attempts);
    }
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        return StreamConfig {
            transport: Transport::Sse,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_attempts: 10,
            heartbeat: Duration::from_millis(30000),
        };
    }
}

pub type Listener = Arc<dyn Fn(&ServerEvent) -> Result<()> + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&StreamError) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    kind: String,
    listener: Listener,
}

struct StreamState {
    recent: RecentEvents,
    connected_seen: bool,
    next_id: u64,
    listeners: Vec<ListenerEntry>,
    error_listeners: Vec<(u64, ErrorListener)>,
}

/// Cancels the background subscription when asked.
pub struct StreamHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        return self.task.is_finished();
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!(error = ?err, "Event stream task failed");
        }
    }
}

/// Single pipe for server events. Normalizes envelopes, drops duplicates
/// and repeated connection announcements, then hands each event to the
/// registered listeners in arrival order.
#[derive(Clone)]
pub struct EventStream {
    config: StreamConfig,
    state: Arc<Mutex<StreamState>>,
}

impl EventStream {
    pub fn new(config: StreamConfig) -> EventStream {
        return EventStream {
            config,
            state: Arc::new(Mutex::new(StreamState {
                recent: RecentEvents::new(DEDUP_CAPACITY),
                connected_seen: false,
                next_id: 0,
                listeners: vec![],
                error_listeners: vec![],
            })),
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        return self.state.lock().unwrap_or_else(PoisonError::into_inner);
    }

    /// Registers a listener for one event type, or every type with
    /// [`WILDCARD`]. Returns an id for [`EventStream::off`].
    pub fn on<F>(&self, kind: &str, listener: F) -> u64
    where
        F: Fn(&ServerEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.listeners.push(ListenerEntry {
            id,
            kind: kind.to_string(),
            listener: Arc::new(listener),
        });

        return id;
    }

    pub fn on_error<F>(&self, listener: F) -> u64
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.error_listeners.push((id, Arc::new(listener)));

        return id;
    }

    pub fn off(&self, id: u64) {
        let mut state = self.lock();
        state.listeners.retain(|e| return e.id != id);
        state.error_listeners.retain(|(listener_id, _)| return *listener_id != id);
    }

    /// Feeds one raw event through normalization and duplicate suppression.
    /// Returns whether it was delivered.
    pub fn ingest(&self, raw: &Value) -> bool {
        return self.ingest_at(raw, now_millis());
    }

    fn ingest_at(&self, raw: &Value, arrived_at: i64) -> bool {
        let envelope = Envelope::normalize(raw);
        let event = ServerEvent::from_envelope(&envelope, arrived_at);

        {
            let mut state = self.lock();
            if event == ServerEvent::Connected {
                if state.connected_seen {
                    tracing::debug!("Dropping repeated server.connected");
                    return false;
                }
                state.connected_seen = true;
            }

            // Tool output arrives as deltas, so identical chunks are distinct.
            let is_delta = matches!(event, ServerEvent::ToolOutput { .. });
            if !is_delta && !state.recent.insert(RecentEvents::key(&envelope, raw, arrived_at)) {
                tracing::debug!(kind = envelope.kind, "Dropping duplicate event");
                return false;
            }
        }

        self.dispatch(&envelope.kind, &event);

        return true;
    }

    /// Hands the event to every listener for `kind`, isolating listener
    /// failures and panics from each other.
    fn dispatch(&self, kind: &str, event: &ServerEvent) {
        let listeners = self
            .lock()
            .listeners
            .iter()
            .filter(|e| return e.kind == WILDCARD || e.kind == kind)
            .map(|e| return e.listener.clone())
            .collect::<Vec<Listener>>();

        for listener in listeners {
            let res = panic::catch_unwind(panic::AssertUnwindSafe(|| return listener(event)));
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = ?err, kind, "Event listener failed");
                }
                Err(_) => {
                    tracing::error!(kind, "Event listener panicked");
                }
            }
        }
    }

    fn emit_error(&self, err: StreamError) {
        tracing::warn!(error = %err, "Event stream error");
        let listeners = self
            .lock()
            .error_listeners
            .iter()
            .map(|(_, listener)| return listener.clone())
            .collect::<Vec<ErrorListener>>();

        for listener in listeners {
            if panic::catch_unwind(panic::AssertUnwindSafe(|| return listener(&err))).is_err() {
                tracing::error!("Event error listener panicked");
            }
        }
    }

    /// Starts consuming the source in the background, reconnecting with
    /// backoff until cancelled or out of attempts.
    pub fn subscribe(&self, source: EventSourceBox) -> StreamHandle {
        let token = CancellationToken::new();
        let stream = self.clone();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            stream.run(source, task_token).await;
        });

        return StreamHandle { token, task };
    }

    async fn run(&self, source: EventSourceBox, token: CancellationToken) {
        let mut backoff = self.config.backoff();
        let mut connected_before = false;

        loop {
            let res = tokio::select! {
                _ = token.cancelled() => return,
                res = self.run_connection(&source, &mut backoff, &mut connected_before) => res,
            };

            if let Err(err) = res {
                self.emit_error(StreamError::Disconnected(err.to_string()));
            }

            let delay = match backoff.next_delay() {
                Some(delay) => delay,
                None => {
                    self.emit_error(StreamError::GaveUp(backoff.attempts()));
                    return;
                }
            };

            tracing::info!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting event stream"
            );

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    /// The backoff only starts over once the connection has proven itself,
    /// so a server that accepts and immediately drops still runs out of
    /// attempts.
    async fn run_connection(
        &self,
        source: &EventSourceBox,
        backoff: &mut Backoff,
        connected_before: &mut bool,
    ) -> Result<()> {
        let mut conn = source.connect().await?;
        tracing::info!("Event stream connected");
        if *connected_before {
            self.dispatch(RECONNECTED, &ServerEvent::Reconnected);
        }
        *connected_before = true;

        match self.config.transport.clone() {
            Transport::Sse => return self.read_stream(&mut conn, backoff).await,
            Transport::Poll {
                interval,
                batch_size,
            } => return self.poll_stream(&mut conn, backoff, interval, batch_size).await,
        }
    }

    async fn read_stream(&self, conn: &mut EventConnection, backoff: &mut Backoff) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                item = conn.events.next() => match item {
                    Some(Ok(raw)) => {
                        self.ingest(&raw);
                        if carries_data(&raw) {
                            backoff.reset();
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => bail!("Event stream ended"),
                },
                _ = heartbeat.tick() => {
                    if !conn.is_open() {
                        bail!("Event stream found closed by heartbeat");
                    }
                    backoff.reset();
                }
            }
        }
    }

    /// Pulls at most `batch_size` ready events per tick.
    async fn poll_stream(
        &self,
        conn: &mut EventConnection,
        backoff: &mut Backoff,
        interval: Duration,
        batch_size: usize,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        let connected_at = Instant::now();

        loop {
            ticker.tick().await;
            for _ in 0..batch_size {
                match conn.events.next().now_or_never() {
                    Some(Some(Ok(raw))) => {
                        self.ingest(&raw);
                        if carries_data(&raw) {
                            backoff.reset();
                        }
                    }
                    Some(Some(Err(err))) => return Err(err),
                    Some(None) => bail!("Event stream ended"),
                    None => break,
                }
            }

            if !conn.is_open() {
                bail!("Event stream found closed while polling");
            }
            if connected_at.elapsed() >= self.config.heartbeat {
                backoff.reset();
            }
        }
    }
}

/// Whether a raw event is more than the connection announcement.
fn carries_data(raw: &Value) -> bool {
    return Envelope::normalize(raw).kind != "server.connected";
}
