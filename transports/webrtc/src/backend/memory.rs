//! In-process call store
//!
//! Holds calls, participants and the signaling queue behind one lock and
//! notifies subscribers through a version counter on every mutation.

use super::CallBackend;
use crate::participant::{CallId, Participant, ParticipantId};
use crate::signaling::{OutgoingSignal, SignalId, SignalMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default lifetime of a call record
const CALL_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// Time source for the store
pub trait Clock: Send + Sync {
    /// Milliseconds since the epoch
    fn now_millis(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Start at `start_ms`
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Jump to `ms`
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Call lifecycle as tracked by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created, fewer than two participants so far
    Ringing,
    /// Two or more participants have joined
    Active,
    /// Ended explicitly or by the last participant leaving
    Ended,
}

/// Options for creating a call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Participant limit (default: 10)
    pub max_participants: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_participants: 10,
        }
    }
}

/// Snapshot of a call record
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Call identifier
    pub id: CallId,
    /// Lifecycle state
    pub state: CallState,
    /// Participant limit
    pub max_participants: u32,
    /// When the second participant joined
    pub started_at: Option<u64>,
    /// When the call ended
    pub ended_at: Option<u64>,
    /// Expiry timestamp
    pub expires_at: u64,
}

struct CallRecord {
    info: CallInfo,
    participants: Vec<Participant>,
}

impl CallRecord {
    fn active(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active())
    }
}

#[derive(Default)]
struct Store {
    calls: HashMap<CallId, CallRecord>,
    signals: Vec<SignalMessage>,
    failing_sends: u32,
}

struct Shared {
    store: Mutex<Store>,
    changes: watch::Sender<u64>,
    clock: Arc<dyn Clock>,
    signal_ttl_ms: u64,
}

impl Shared {
    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn active_participants(&self, call_id: &CallId) -> Vec<Participant> {
        let store = self.store.lock();
        store
            .calls
            .get(call_id)
            .map(|call| call.active().cloned().collect())
            .unwrap_or_default()
    }

    fn pending_for(&self, call_id: &CallId, me: &ParticipantId) -> Vec<SignalMessage> {
        let now = self.clock.now_millis();
        let store = self.store.lock();
        // Insertion order is creation order.
        store
            .signals
            .iter()
            .filter(|s| &s.call_id == call_id && &s.to == me && s.is_actionable(now))
            .cloned()
            .collect()
    }
}

/// In-memory [`CallBackend`]
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Store on the wall clock with a 60s signal lifetime
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), Duration::from_secs(60))
    }

    /// Store on a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>, signal_ttl: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                changes,
                clock,
                signal_ttl_ms: signal_ttl.as_millis() as u64,
            }),
        }
    }

    /// Create a new call in the ringing state
    pub fn create_call(&self, options: CallOptions) -> CallId {
        let now = self.shared.clock.now_millis();
        let id = CallId::new(format!("call-{}", uuid::Uuid::new_v4()));
        let record = CallRecord {
            info: CallInfo {
                id: id.clone(),
                state: CallState::Ringing,
                max_participants: options.max_participants,
                started_at: None,
                ended_at: None,
                expires_at: now + CALL_TTL.as_millis() as u64,
            },
            participants: Vec::new(),
        };

        self.shared.store.lock().calls.insert(id.clone(), record);
        self.shared.notify();
        info!("Created call {}", id);
        id
    }

    /// Snapshot of a call record
    pub fn call(&self, call_id: &CallId) -> Option<CallInfo> {
        self.shared
            .store
            .lock()
            .calls
            .get(call_id)
            .map(|c| c.info.clone())
    }

    /// Every message ever stored for the call, delivered or not
    pub fn all_signals(&self, call_id: &CallId) -> Vec<SignalMessage> {
        self.shared
            .store
            .lock()
            .signals
            .iter()
            .filter(|s| &s.call_id == call_id)
            .cloned()
            .collect()
    }

    /// Make the next `count` sends fail with a signaling error
    pub fn inject_send_failures(&self, count: u32) {
        self.shared.store.lock().failing_sends = count;
    }

    /// Drop expired messages. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.shared.clock.now_millis();
        let removed = {
            let mut store = self.shared.store.lock();
            let before = store.signals.len();
            store.signals.retain(|s| s.expires_at > now);
            before - store.signals.len()
        };
        if removed > 0 {
            debug!("Purged {} expired signal(s)", removed);
            self.shared.notify();
        }
        removed
    }
}

#[async_trait]
impl CallBackend for MemoryBackend {
    async fn join_call(&self, call_id: &CallId, display_name: &str) -> Result<ParticipantId> {
        let now = self.shared.clock.now_millis();
        let id = {
            let mut store = self.shared.store.lock();
            let call = store
                .calls
                .get_mut(call_id)
                .filter(|c| c.info.expires_at > now)
                .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;

            if call.info.state == CallState::Ended {
                return Err(Error::CallEnded(call_id.to_string()));
            }

            if call.active().count() >= call.info.max_participants as usize {
                return Err(Error::CallFull(format!(
                    "{} already has {} participants",
                    call_id, call.info.max_participants
                )));
            }

            let id = ParticipantId::new(format!("p-{}", uuid::Uuid::new_v4()));
            call.participants.push(Participant {
                id: id.clone(),
                display_name: display_name.to_string(),
                joined_at: now,
                left_at: None,
            });

            if call.active().count() >= 2 && call.info.state == CallState::Ringing {
                call.info.state = CallState::Active;
                call.info.started_at = Some(now);
            }
            id
        };

        self.shared.notify();
        info!("{} joined call {} as {}", display_name, call_id, id);
        Ok(id)
    }

    async fn leave_call(&self, call_id: &CallId, participant: &ParticipantId) -> Result<()> {
        let now = self.shared.clock.now_millis();
        {
            let mut store = self.shared.store.lock();
            let Some(call) = store.calls.get_mut(call_id) else {
                return Ok(());
            };

            if let Some(p) = call
                .participants
                .iter_mut()
                .find(|p| &p.id == participant && p.is_active())
            {
                p.left_at = Some(now);
            }

            if call.info.state != CallState::Ended && call.active().count() == 0 {
                call.info.state = CallState::Ended;
                call.info.ended_at = Some(now);
                info!("Last participant left, call {} ended", call_id);
            }
        }

        self.shared.notify();
        Ok(())
    }

    async fn end_call(&self, call_id: &CallId) -> Result<()> {
        let now = self.shared.clock.now_millis();
        {
            let mut store = self.shared.store.lock();
            let Some(call) = store.calls.get_mut(call_id) else {
                return Ok(());
            };
            if call.info.state == CallState::Ended {
                return Ok(());
            }

            call.info.state = CallState::Ended;
            call.info.ended_at = Some(now);
            for p in call.participants.iter_mut().filter(|p| p.left_at.is_none()) {
                p.left_at = Some(now);
            }
        }

        self.shared.notify();
        info!("Call {} ended", call_id);
        Ok(())
    }

    async fn participants(&self, call_id: &CallId) -> Result<Vec<Participant>> {
        Ok(self.shared.active_participants(call_id))
    }

    fn subscribe_participants(&self, call_id: &CallId) -> BoxStream<'static, Vec<Participant>> {
        let shared = Arc::clone(&self.shared);
        let call_id = call_id.clone();
        let rx = shared.changes.subscribe();

        stream::unfold((rx, None), move |(mut rx, last)| {
            let shared = Arc::clone(&shared);
            let call_id = call_id.clone();
            async move {
                loop {
                    if last.is_some() && rx.changed().await.is_err() {
                        return None;
                    }
                    let roster = shared.active_participants(&call_id);
                    if last.as_ref() != Some(&roster) {
                        return Some((roster.clone(), (rx, Some(roster))));
                    }
                }
            }
        })
        .boxed()
    }

    async fn send_signal(&self, signal: OutgoingSignal) -> Result<()> {
        let now = self.shared.clock.now_millis();
        {
            let mut store = self.shared.store.lock();

            if store.failing_sends > 0 {
                store.failing_sends -= 1;
                return Err(Error::SignalingError("injected send failure".to_string()));
            }

            let call = store
                .calls
                .get(&signal.call_id)
                .ok_or_else(|| Error::CallNotFound(signal.call_id.to_string()))?;

            let member = |id: &ParticipantId| call.participants.iter().any(|p| &p.id == id);
            if !member(&signal.from) || !member(&signal.to) {
                return Err(Error::ParticipantNotFound(format!(
                    "{} -> {} not in call {}",
                    signal.from, signal.to, signal.call_id
                )));
            }

            store.signals.push(SignalMessage {
                id: SignalId::new(format!("sig-{}", uuid::Uuid::new_v4())),
                call_id: signal.call_id,
                kind: signal.kind,
                from: signal.from,
                to: signal.to,
                payload: signal.payload,
                created_at: now,
                expires_at: now + self.shared.signal_ttl_ms,
                delivered: false,
            });
        }

        self.shared.notify();
        Ok(())
    }

    async fn pending_signals(
        &self,
        call_id: &CallId,
        me: &ParticipantId,
    ) -> Result<Vec<SignalMessage>> {
        Ok(self.shared.pending_for(call_id, me))
    }

    fn subscribe_signals(
        &self,
        call_id: &CallId,
        me: &ParticipantId,
    ) -> BoxStream<'static, Vec<SignalMessage>> {
        let shared = Arc::clone(&self.shared);
        let call_id = call_id.clone();
        let me = me.clone();
        let rx = shared.changes.subscribe();

        stream::unfold((rx, None), move |(mut rx, last)| {
            let shared = Arc::clone(&shared);
            let call_id = call_id.clone();
            let me = me.clone();
            async move {
                loop {
                    if last.is_some() && rx.changed().await.is_err() {
                        return None;
                    }
                    let batch = shared.pending_for(&call_id, &me);
                    if last.as_ref() != Some(&batch) {
                        return Some((batch.clone(), (rx, Some(batch))));
                    }
                }
            }
        })
        .boxed()
    }

    async fn mark_delivered(&self, signal_id: &SignalId) -> Result<()> {
        let changed = {
            let mut store = self.shared.store.lock();
            match store.signals.iter_mut().find(|s| &s.id == signal_id) {
                Some(signal) if !signal.delivered => {
                    signal.delivered = true;
                    true
                }
                Some(_) => false,
                None => {
                    warn!("mark_delivered for unknown signal {}", signal_id);
                    false
                }
            }
        };

        if changed {
            self.shared.notify();
        }
        Ok(())
    }
}
