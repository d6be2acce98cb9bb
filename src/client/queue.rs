//! Debounced, single-flight save queue.
//!
//! Edits mark a field dirty and (re)start its debounce timer. When a timer
//! elapses the field joins a FIFO queue; one worker task sends queued fields
//! one at a time with a short gap between requests. The value sent is always
//! the latest value of the field at dispatch time.

use super::state::{FieldEvent, FieldKey, FieldState};
use super::transport::{Transport, TransportError};
use crate::core::FieldUpdate;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const ALERT_MESSAGE: &str = "Some changes could not be saved. Keep this page open and try again.";

#[derive(Debug, Clone)]
pub struct SaveQueueConfig {
    pub simple_debounce: Duration,
    pub list_debounce: Duration,
    pub request_gap: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub parked_retry: Duration,
    pub flush_poll: Duration,
    pub flush_timeout: Duration,
    pub session_backup_interval: Duration,
}

impl Default for SaveQueueConfig {
    fn default() -> Self {
        Self {
            simple_debounce: Duration::from_millis(1200),
            list_debounce: Duration::from_millis(2000),
            request_gap: Duration::from_millis(150),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            parked_retry: Duration::from_millis(5000),
            flush_poll: Duration::from_millis(50),
            flush_timeout: Duration::from_millis(5000),
            session_backup_interval: Duration::from_secs(600),
        }
    }
}

impl SaveQueueConfig {
    fn debounce_for(&self, key: &FieldKey) -> Duration {
        if key.is_list_item() {
            self.list_debounce
        } else {
            self.simple_debounce
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveEvent {
    Saved(FieldKey),
    Retrying { key: FieldKey, attempt: u32 },
    Parked(FieldKey),
    Failed { key: FieldKey, error: String },
    Alert(String),
    /// Nothing queued and nothing in flight.
    Drained,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaveQueueError {
    #[error("save queue did not drain within {waited_ms} ms")]
    FlushTimeout { waited_ms: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadReport {
    pub saved: usize,
    pub errors: usize,
    pub failed: usize,
}

struct Entry {
    state: FieldState,
    value: Value,
    generation: u64,
    /// Order of the latest edit across all fields.
    edited: u64,
    timer: Option<JoinHandle<()>>,
    parked: bool,
}

impl Entry {
    fn idle() -> Self {
        Self {
            state: FieldState::Idle,
            value: Value::Null,
            generation: 0,
            edited: 0,
            timer: None,
            parked: false,
        }
    }
}

struct Dispatch {
    key: FieldKey,
    update: FieldUpdate,
    generation: u64,
    context: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<FieldKey, Entry>,
    queue: VecDeque<FieldKey>,
    buffered: Vec<FieldKey>,
    switching: bool,
    in_flight: Option<FieldKey>,
    alert_shown: bool,
    activity: bool,
    edits: u64,
    context: u64,
}

impl Inner {
    /// Moves a field into the queue, or into the switch buffer while a
    /// character switch is running. Returns true when the worker should wake.
    fn enqueue(&mut self, key: &FieldKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(next) = entry.state.on(FieldEvent::Enqueued) else {
            return false;
        };
        entry.state = next;
        if self.switching {
            self.buffered.push(key.clone());
            false
        } else {
            self.queue.push_back(key.clone());
            true
        }
    }

    fn dispatch_next(&mut self) -> Option<Dispatch> {
        while let Some(key) = self.queue.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let Some(next) = entry.state.on(FieldEvent::Dispatched) else {
                continue;
            };
            entry.state = next;
            self.in_flight = Some(key.clone());
            return Some(Dispatch {
                update: key.to_update(entry.value.clone()),
                generation: entry.generation,
                context: self.context,
                key,
            });
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    fn has_failures(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.state == FieldState::Failed)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    events: broadcast::Sender<SaveEvent>,
    transport: Arc<dyn Transport>,
    config: SaveQueueConfig,
}

impl Shared {
    fn emit(&self, event: SaveEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn arm(self: &Arc<Self>, key: FieldKey, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let delay = self.config.debounce_for(&key);
        tokio::spawn(async move {
            sleep(delay).await;
            shared.debounce_elapsed(&key, generation).await;
        })
    }

    async fn debounce_elapsed(&self, key: &FieldKey, generation: u64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.timer = None;
        // An in-flight field is re-queued when its request completes.
        if entry.state == FieldState::InFlight {
            return;
        }
        if inner.enqueue(key) {
            self.wake.notify_one();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next = self.inner.lock().await.dispatch_next();
            let Some(dispatch) = next else {
                self.wake.notified().await;
                continue;
            };
            let result = self.send(&dispatch.key, &dispatch.update).await;
            self.complete(dispatch, result).await;
            sleep(self.config.request_gap).await;
        }
    }

    async fn send(&self, key: &FieldKey, update: &FieldUpdate) -> Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.transport.save_field(&key.character, update).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff_base * 2u32.pow(attempt - 1);
                    debug!(field = %key, attempt, error = %err, "save failed, backing off");
                    self.emit(SaveEvent::Retrying {
                        key: key.clone(),
                        attempt,
                    });
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn complete(self: &Arc<Self>, dispatch: Dispatch, result: Result<(), TransportError>) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = None;
        if dispatch.context != inner.context {
            debug!(field = %dispatch.key, "dropping completion from a discarded context");
            return;
        }

        let key = dispatch.key;
        match result {
            Ok(()) => {
                let Some(entry) = inner.entries.get_mut(&key) else {
                    return;
                };
                if entry.generation == dispatch.generation {
                    inner.entries.remove(&key);
                } else {
                    entry.state = entry
                        .state
                        .on(FieldEvent::AckedStale)
                        .unwrap_or(FieldState::Dirty);
                    if entry.timer.is_none() && inner.enqueue(&key) {
                        self.wake.notify_one();
                    }
                }
                self.emit(SaveEvent::Saved(key));
            }
            Err(err) => {
                let context = inner.context;
                let Some(entry) = inner.entries.get_mut(&key) else {
                    return;
                };
                entry.state = entry
                    .state
                    .on(FieldEvent::SendFailed)
                    .unwrap_or(FieldState::Failed);

                if err.is_retryable() && !entry.parked {
                    entry.parked = true;
                    warn!(field = %key, error = %err, "save failed, parking for one more try");
                    self.park(key.clone(), entry.generation, context);
                    self.emit(SaveEvent::Parked(key));
                } else {
                    warn!(field = %key, error = %err, "save failed");
                    self.emit(SaveEvent::Failed {
                        key,
                        error: err.to_string(),
                    });
                    if !inner.alert_shown {
                        inner.alert_shown = true;
                        self.emit(SaveEvent::Alert(ALERT_MESSAGE.to_string()));
                    }
                }
            }
        }

        if inner.is_drained() {
            // The alert stays shown until a drain leaves nothing failed.
            if !inner.has_failures() {
                inner.alert_shown = false;
            }
            self.emit(SaveEvent::Drained);
        }
    }

    fn park(self: &Arc<Self>, key: FieldKey, generation: u64, context: u64) {
        let shared = Arc::clone(self);
        let delay = self.config.parked_retry;
        tokio::spawn(async move {
            sleep(delay).await;
            let mut inner = shared.inner.lock().await;
            if inner.context != context {
                return;
            }
            match inner.entries.get(&key) {
                Some(entry) if entry.state == FieldState::Failed && entry.generation == generation => {}
                _ => return,
            }
            if inner.enqueue(&key) {
                shared.wake.notify_one();
            }
        });
    }
}

/// Client-side save pipeline for one page.
///
/// Must be created inside a tokio runtime.
pub struct SaveQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl SaveQueue {
    pub fn new(transport: Arc<dyn Transport>, config: SaveQueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
            events,
            transport,
            config,
        });
        let worker = tokio::spawn(Arc::clone(&shared).run());
        Self { shared, worker }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.shared.events.subscribe()
    }

    /// Records a new value and restarts the field's debounce timer.
    pub async fn edit(&self, key: FieldKey, value: Value) {
        let mut inner = self.shared.inner.lock().await;
        inner.activity = true;
        inner.edits += 1;
        let edited = inner.edits;

        let Inner {
            entries,
            queue,
            buffered,
            ..
        } = &mut *inner;
        let entry = entries.entry(key.clone()).or_insert_with(Entry::idle);
        let Some(next) = entry.state.on(FieldEvent::Edited) else {
            return;
        };
        if entry.state == FieldState::Queued {
            queue.retain(|queued| queued != &key);
            buffered.retain(|queued| queued != &key);
        }
        if entry.state != FieldState::InFlight {
            entry.parked = false;
        }

        entry.state = next;
        entry.value = value;
        entry.generation += 1;
        entry.edited = edited;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.timer = Some(self.shared.arm(key, entry.generation));
    }

    pub async fn state_of(&self, key: &FieldKey) -> FieldState {
        let inner = self.shared.inner.lock().await;
        inner
            .entries
            .get(key)
            .map(|entry| entry.state)
            .unwrap_or(FieldState::Idle)
    }

    /// Fields holding a value the server has not confirmed.
    pub async fn dirty_fields(&self) -> Vec<(FieldKey, FieldState)> {
        let inner = self.shared.inner.lock().await;
        let mut fields: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_pending())
            .map(|(key, entry)| (key.clone(), entry.state))
            .collect();
        fields.sort();
        fields
    }

    pub async fn has_unsaved_changes(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.entries.values().any(|entry| entry.state.is_pending())
    }

    /// Fires every pending debounce timer now, then waits for the queue and
    /// any in-flight request to finish.
    pub async fn flush(&self) -> Result<(), SaveQueueError> {
        {
            let mut inner = self.shared.inner.lock().await;
            let mut fired: Vec<(u64, FieldKey)> = inner
                .entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    entry.timer.take().map(|timer| {
                        timer.abort();
                        (entry.edited, key.clone())
                    })
                })
                .collect();
            // Same order the timers would have fired in.
            fired.sort();
            let mut wake = false;
            for (_, key) in &fired {
                wake |= inner.enqueue(key);
            }
            if wake {
                self.shared.wake.notify_one();
            }
        }

        let started = Instant::now();
        loop {
            if self.shared.inner.lock().await.is_drained() {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.shared.config.flush_timeout {
                let waited_ms = waited.as_millis() as u64;
                warn!(waited_ms, "flush timed out");
                return Err(SaveQueueError::FlushTimeout { waited_ms });
            }
            sleep(self.shared.config.flush_poll).await;
        }
    }

    /// Flushes, then buffers newly debounced fields until [`end_switch`].
    ///
    /// The switch starts even when the flush times out; unsent values stay
    /// pending and are retried afterwards.
    ///
    /// [`end_switch`]: SaveQueue::end_switch
    pub async fn begin_switch(&self) -> Result<(), SaveQueueError> {
        let flushed = self.flush().await;
        self.shared.inner.lock().await.switching = true;
        flushed
    }

    /// Replays fields buffered during the switch, in the order they arrived.
    pub async fn end_switch(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.switching = false;
        let buffered = std::mem::take(&mut inner.buffered);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "replaying saves buffered during switch");
            inner.queue.extend(buffered);
            self.shared.wake.notify_one();
        }
    }

    /// Runs `load` between [`begin_switch`](SaveQueue::begin_switch) and
    /// [`end_switch`](SaveQueue::end_switch).
    pub async fn switch_character<F, Fut, T>(&self, load: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Err(err) = self.begin_switch().await {
            warn!(error = %err, "switching with saves still pending");
        }
        let loaded = load().await;
        self.end_switch().await;
        loaded
    }

    /// Forgets every pending value. Completions still in flight are ignored.
    pub async fn discard(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.context += 1;
        for entry in inner.entries.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            if let Some(next) = entry.state.on(FieldEvent::Discarded) {
                entry.state = next;
            }
            entry.value = Value::Null;
            entry.parked = false;
        }
        inner.queue.clear();
        inner.buffered.clear();
        inner.alert_shown = false;
    }

    /// Page teardown: a bounded flush, then whatever is still pending goes out
    /// as one batch per character, outside the queue.
    pub async fn unload(&self) -> UnloadReport {
        if let Err(err) = self.flush().await {
            warn!(error = %err, "unload flush incomplete");
        }

        let pending: BTreeMap<String, Vec<FieldUpdate>> = {
            let inner = self.shared.inner.lock().await;
            let mut sorted: Vec<_> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.state.is_pending())
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));

            let mut grouped: BTreeMap<String, Vec<FieldUpdate>> = BTreeMap::new();
            for (key, entry) in sorted {
                grouped
                    .entry(key.character.clone())
                    .or_default()
                    .push(key.to_update(entry.value.clone()));
            }
            grouped
        };

        let mut report = UnloadReport::default();
        for (character, updates) in pending {
            match self.shared.transport.save_batch(&character, &updates).await {
                Ok(ack) => {
                    report.saved += ack.saved;
                    report.errors += ack.errors;
                }
                Err(err) => {
                    warn!(character = %character, count = updates.len(), error = %err, "unload batch failed");
                    report.failed += updates.len();
                }
            }
        }
        if report != UnloadReport::default() {
            info!(saved = report.saved, errors = report.errors, failed = report.failed, "unload batch sent");
        }
        report
    }

    /// Requests a session backup on every interval in which the user edited
    /// something.
    pub fn spawn_session_backups(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let period = shared.config.session_backup_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let active = std::mem::take(&mut shared.inner.lock().await.activity);
                if !active {
                    continue;
                }
                match shared.transport.create_session_backup().await {
                    Ok(name) => info!(backup = %name, "session backup created"),
                    Err(err) => warn!(error = %err, "session backup failed"),
                }
            }
        })
    }
}

impl Drop for SaveQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
