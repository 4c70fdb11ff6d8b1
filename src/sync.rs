use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flume::Sender;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::{CredentialProvider, StatusTransport, TransportError};
use crate::status::{SubjectKind, TrainingStatusEvent};

pub type StatusCallback = Arc<dyn Fn(TrainingStatusEvent) + Send + Sync>;

/// Process-wide synchronizer failures. Delivered at most once per halt on
/// the fault channel handed to [`StatusSynchronizer::new`].
#[derive(Debug, Clone, Error)]
pub enum SyncFault {
    #[error("authentication rejected {failures} consecutive times; status synchronization halted")]
    AuthFailed { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub auth_failure_limit: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            auth_failure_limit: 3,
        }
    }
}

/// Counters exposed for logging and tests. `tickers_started` stays at 1
/// no matter how many subjects are watched while the ticker lives.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub active_subscriptions: usize,
    pub ticker_active: bool,
    pub tickers_started: u64,
    pub ticks: u64,
    pub checks: u64,
    pub halted: bool,
}

type SubjectKey = (String, SubjectKind);

struct Registration {
    callback: StatusCallback,
    in_flight: bool,
}

#[derive(Default)]
struct SyncState {
    subscriptions: HashMap<SubjectKey, Registration>,
    ticker: Option<JoinHandle<()>>,
    halted: bool,
    consecutive_auth_failures: u32,
    tickers_started: u64,
    ticks: u64,
    checks: u64,
}

struct SyncInner<T, C> {
    transport: T,
    credentials: C,
    settings: SyncSettings,
    fault_tx: Sender<SyncFault>,
    state: Mutex<SyncState>,
}

impl<T, C> Drop for SyncInner<T, C> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
        }
    }
}

/// Keeps "is subject X still training" fresh for any number of watchers.
///
/// Two producers feed one reducer: a shared polling ticker (at most one
/// system-wide, multiplexed across every subscription) and, optionally,
/// push events handed in via [`ingest`]. Observing a terminal state
/// removes the subscription before its callback runs, so no further
/// checks can happen for that subject. Identical consecutive
/// observations are not deduplicated; with both producers wired a caller
/// sees duplicates and must apply updates idempotently.
///
/// This is a cheap cloneable handle over shared state. Subscribing
/// requires an ambient tokio runtime (checks and the ticker are spawned
/// tasks); the ticker holds only a weak reference, so dropping the last
/// handle stops polling.
///
/// [`ingest`]: StatusSynchronizer::ingest
pub struct StatusSynchronizer<T, C> {
    inner: Arc<SyncInner<T, C>>,
}

impl<T, C> Clone for StatusSynchronizer<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C> StatusSynchronizer<T, C>
where
    T: StatusTransport + 'static,
    C: CredentialProvider + 'static,
{
    pub fn new(
        transport: T,
        credentials: C,
        settings: SyncSettings,
        fault_tx: Sender<SyncFault>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                transport,
                credentials,
                settings,
                fault_tx,
                state: Mutex::new(SyncState::default()),
            }),
        }
    }

    /// Registers interest in a subject and fires the first check
    /// immediately. Re-subscribing the same subject replaces the existing
    /// registration. Without a credential (or after a halt) this logs and
    /// does nothing: the caller sees no callback and should treat the
    /// status as unknown.
    pub fn subscribe<F>(&self, subject_id: &str, kind: SubjectKind, callback: F)
    where
        F: Fn(TrainingStatusEvent) + Send + Sync + 'static,
    {
        if self.inner.credentials.token().is_none() {
            tracing::warn!(
                "No API credential available; ignoring subscription for {} {}",
                kind.as_str(),
                subject_id
            );
            return;
        }

        let key: SubjectKey = (subject_id.to_string(), kind);
        {
            let mut state = self.state();
            if state.halted {
                tracing::warn!(
                    "Synchronizer halted; refusing subscription for {} {}",
                    kind.as_str(),
                    subject_id
                );
                return;
            }
            state.subscriptions.insert(
                key.clone(),
                Registration {
                    callback: Arc::new(callback),
                    in_flight: false,
                },
            );
            self.ensure_ticker(&mut state);
        }

        self.spawn_check(key);
    }

    /// Removes a registration. No-op for unknown subjects; safe to call
    /// repeatedly. Stops the shared ticker when the last subscription
    /// goes away.
    pub fn unsubscribe(&self, subject_id: &str, kind: SubjectKind) {
        let mut state = self.state();
        state
            .subscriptions
            .remove(&(subject_id.to_string(), kind));
        if state.subscriptions.is_empty() {
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
        }
    }

    /// Push-path entry point: applies an externally observed event to the
    /// subscription map. Events for unknown subjects are discarded, which
    /// also covers responses racing an unsubscribe.
    pub fn ingest(&self, event: TrainingStatusEvent) {
        let key: SubjectKey = (event.subject_id.clone(), event.subject_kind);
        // A poll check may be in flight for the same subject; its own
        // completion clears the flag, not this push delivery.
        self.deliver(&key, event, false);
    }

    /// One scheduling round: spawn a check for every subscribed subject
    /// that has none in flight. The interval ticker calls this on a
    /// cadence; tests call it directly. The returned handles complete
    /// when the spawned checks do.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        let due: Vec<SubjectKey> = {
            let mut state = self.state();
            if state.halted {
                return Vec::new();
            }
            state.ticks += 1;
            state
                .subscriptions
                .iter()
                .filter(|(_, registration)| !registration.in_flight)
                .map(|(key, _)| key.clone())
                .collect()
        };

        due.into_iter()
            .filter_map(|key| self.spawn_check(key))
            .collect()
    }

    /// Manual stop: drops every subscription and the ticker. Does not
    /// emit a fault.
    pub fn halt(&self) {
        let mut state = self.state();
        state.halted = true;
        state.subscriptions.clear();
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
    }

    /// Re-arms a halted synchronizer after the caller has dealt with the
    /// credential problem. Callers re-subscribe their subjects afterwards.
    pub fn reset(&self) {
        let mut state = self.state();
        state.halted = false;
        state.consecutive_auth_failures = 0;
    }

    pub fn is_halted(&self) -> bool {
        self.state().halted
    }

    pub fn is_watching(&self, subject_id: &str, kind: SubjectKind) -> bool {
        self.state()
            .subscriptions
            .contains_key(&(subject_id.to_string(), kind))
    }

    pub fn stats(&self) -> SyncStats {
        let state = self.state();
        SyncStats {
            active_subscriptions: state.subscriptions.len(),
            ticker_active: state.ticker.is_some(),
            tickers_started: state.tickers_started,
            ticks: state.ticks,
            checks: state.checks,
            halted: state.halted,
        }
    }

    fn ensure_ticker(&self, state: &mut SyncState) {
        if state.ticker.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let poll_interval = self.inner.settings.poll_interval;
        state.tickers_started += 1;
        state.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first interval tick completes immediately; subscribe
            // already fired the first check.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                StatusSynchronizer { inner }.tick();
            }
        }));
        tracing::debug!("Started shared status poll ticker ({:?})", poll_interval);
    }

    /// Marks the subject in flight and spawns its check. Skips subjects
    /// that are gone or already being checked.
    fn spawn_check(&self, key: SubjectKey) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state();
            match state.subscriptions.get_mut(&key) {
                Some(registration) if !registration.in_flight => {
                    registration.in_flight = true;
                }
                _ => return None,
            }
            state.checks += 1;
        }

        let sync = self.clone();
        Some(tokio::spawn(async move {
            sync.check_subject(key).await;
        }))
    }

    async fn check_subject(&self, key: SubjectKey) {
        let token = match self.inner.credentials.token() {
            Some(token) => token,
            None => {
                // Credential disappeared mid-lifetime; equivalent to a
                // backend rejection.
                self.clear_in_flight(&key);
                self.record_auth_failure();
                return;
            }
        };

        match self.inner.transport.fetch_status(&key.0, key.1, &token).await {
            Ok(payload) => {
                {
                    let mut state = self.state();
                    state.consecutive_auth_failures = 0;
                }
                let event = payload.into_event(&key.0, key.1);
                self.deliver(&key, event, true);
            }
            Err(TransportError::Auth) => {
                self.clear_in_flight(&key);
                self.record_auth_failure();
            }
            Err(TransportError::Malformed(detail)) => {
                self.clear_in_flight(&key);
                tracing::warn!(
                    "Malformed status payload for {} {}: {}; keeping prior state",
                    key.1.as_str(),
                    key.0,
                    detail
                );
            }
            Err(error) => {
                self.clear_in_flight(&key);
                tracing::debug!(
                    "Status check for {} {} failed ({}); retrying next tick",
                    key.1.as_str(),
                    key.0,
                    error
                );
            }
        }
    }

    /// Hands an observation to the subject's callback. Terminal states
    /// remove the subscription first, so nothing can be scheduled for the
    /// subject after its final callback. Returns silently when the
    /// subscription no longer exists (unsubscribed while the check was in
    /// flight).
    fn deliver(&self, key: &SubjectKey, event: TrainingStatusEvent, from_poll: bool) {
        let callback = {
            let mut state = self.state();
            let Some(registration) = state.subscriptions.get_mut(key) else {
                tracing::debug!(
                    "Dropping status for {} {}: no active subscription",
                    key.1.as_str(),
                    key.0
                );
                return;
            };
            if from_poll {
                registration.in_flight = false;
            }
            let callback = registration.callback.clone();

            if event.status.is_terminal() {
                state.subscriptions.remove(key);
                if state.subscriptions.is_empty() {
                    if let Some(ticker) = state.ticker.take() {
                        ticker.abort();
                    }
                }
            }
            callback
        };

        // Outside the lock: the callback may re-enter subscribe/unsubscribe.
        callback(event);
    }

    fn clear_in_flight(&self, key: &SubjectKey) {
        let mut state = self.state();
        if let Some(registration) = state.subscriptions.get_mut(key) {
            registration.in_flight = false;
        }
    }

    fn record_auth_failure(&self) {
        let fault = {
            let mut state = self.state();
            if state.halted {
                return;
            }
            state.consecutive_auth_failures += 1;
            tracing::warn!(
                "Authentication failure {}/{} while polling training status",
                state.consecutive_auth_failures,
                self.inner.settings.auth_failure_limit
            );
            if state.consecutive_auth_failures < self.inner.settings.auth_failure_limit {
                return;
            }

            state.halted = true;
            state.subscriptions.clear();
            if let Some(ticker) = state.ticker.take() {
                ticker.abort();
            }
            SyncFault::AuthFailed {
                failures: state.consecutive_auth_failures,
            }
        };

        tracing::error!("{}; callers must re-authenticate and re-subscribe", fault);
        let _ = self.inner.fault_tx.send(fault);
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        // Recover from poisoning; state is a plain map plus counters.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RawStatusPayload;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct StaticToken(Option<&'static str>);

    impl CredentialProvider for StaticToken {
        fn token(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn payload(status: &str) -> RawStatusPayload {
        RawStatusPayload {
            status: status.to_string(),
            progress: None,
            message: None,
            error: None,
        }
    }

    /// Replays a script of responses; repeats the last entry once the
    /// script is down to one.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RawStatusPayload, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<RawStatusPayload, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusTransport for ScriptedTransport {
        async fn fetch_status(
            &self,
            _subject_id: &str,
            _kind: SubjectKind,
            _token: &str,
        ) -> Result<RawStatusPayload, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().expect("script lock");
            if script.len() > 1 {
                script.pop_front().expect("non-empty script")
            } else {
                match script.front() {
                    Some(Ok(payload)) => Ok(payload.clone()),
                    Some(Err(TransportError::Auth)) => Err(TransportError::Auth),
                    Some(Err(other)) => Err(TransportError::Network(other.to_string())),
                    None => Err(TransportError::Network("script exhausted".to_string())),
                }
            }
        }
    }

    /// Blocks every check until the gate is released.
    struct GatedTransport {
        gate: Notify,
    }

    #[async_trait]
    impl StatusTransport for GatedTransport {
        async fn fetch_status(
            &self,
            _subject_id: &str,
            _kind: SubjectKind,
            _token: &str,
        ) -> Result<RawStatusPayload, TransportError> {
            self.gate.notified().await;
            Ok(payload("training"))
        }
    }

    fn collector() -> (
        impl Fn(TrainingStatusEvent) + Send + Sync + 'static,
        flume::Receiver<TrainingStatusEvent>,
    ) {
        let (tx, rx) = flume::unbounded();
        (move |event| drop(tx.send(event)), rx)
    }

    async fn run_tick<T, C>(sync: &StatusSynchronizer<T, C>)
    where
        T: StatusTransport + 'static,
        C: CredentialProvider + 'static,
    {
        for handle in sync.tick() {
            handle.await.expect("check task");
        }
    }

    fn event(subject_id: &str, status: crate::status::TrainingStatus) -> TrainingStatusEvent {
        TrainingStatusEvent {
            subject_id: subject_id.to_string(),
            subject_kind: SubjectKind::Agent,
            status,
            progress: None,
            message: None,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn terminal_state_unsubscribes_before_final_callback() {
        let transport = ScriptedTransport::new(vec![
            Ok(payload("training")),
            Ok(payload("Active")),
            Ok(payload("training")),
        ]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);
        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        drop(events.recv_async().await.expect("first check result"));

        run_tick(&sync).await;
        let terminal = events.recv_async().await.expect("terminal event");
        assert!(terminal.status.is_terminal());
        assert!(!sync.is_watching("agent-1", SubjectKind::Agent));

        // Subject is gone; further ticks schedule nothing for it.
        let calls_before = sync.inner.transport.calls();
        run_tick(&sync).await;
        run_tick(&sync).await;
        assert_eq!(sync.inner.transport.calls(), calls_before);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_ticker_for_many_subscriptions() {
        let transport = ScriptedTransport::new(vec![Ok(payload("training"))]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        for id in ["agent-1", "agent-2", "agent-3"] {
            let (callback, _events) = collector();
            sync.subscribe(id, SubjectKind::Agent, callback);
        }
        let (callback, _events) = collector();
        sync.subscribe("kb-1", SubjectKind::KnowledgeBase, callback);

        let stats = sync.stats();
        assert_eq!(stats.active_subscriptions, 4);
        assert_eq!(stats.tickers_started, 1);
        assert!(stats.ticker_active);
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_ticker() {
        let transport = ScriptedTransport::new(vec![Ok(payload("training"))]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, _events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        let (callback, _events) = collector();
        sync.subscribe("agent-2", SubjectKind::Agent, callback);

        sync.unsubscribe("agent-1", SubjectKind::Agent);
        assert!(sync.stats().ticker_active);
        sync.unsubscribe("agent-2", SubjectKind::Agent);
        assert!(!sync.stats().ticker_active);

        // Unsubscribing something that never existed is a no-op.
        sync.unsubscribe("agent-2", SubjectKind::Agent);
        sync.unsubscribe("ghost", SubjectKind::KnowledgeBase);
    }

    #[tokio::test]
    async fn three_consecutive_auth_failures_halt_with_one_fault() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Auth)]);
        let (fault_tx, fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);

        // Failure 1 comes from subscribe's immediate check; let it land.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // Failures 2 and 3; the extra ticks are no-ops after the halt.
        for _ in 0..4 {
            run_tick(&sync).await;
        }

        assert!(sync.is_halted());
        assert_eq!(sync.stats().active_subscriptions, 0);
        assert!(!sync.stats().ticker_active);

        let fault = fault_rx.recv_async().await.expect("fault emitted");
        assert!(matches!(fault, SyncFault::AuthFailed { failures: 3 }));
        assert!(fault_rx.try_recv().is_err(), "exactly one fault");
        assert!(events.try_recv().is_err(), "auth failures never reach the callback");

        // Halted instance refuses new work until reset.
        let (callback, _events) = collector();
        sync.subscribe("agent-2", SubjectKind::Agent, callback);
        assert_eq!(sync.stats().active_subscriptions, 0);
        sync.reset();
        assert!(!sync.is_halted());
    }

    #[tokio::test]
    async fn successful_check_resets_auth_failure_count() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Auth),
            Err(TransportError::Auth),
            Ok(payload("training")),
            Err(TransportError::Auth),
            Err(TransportError::Auth),
            Ok(payload("training")),
        ]);
        let (fault_tx, fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, _events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        for _ in 0..5 {
            run_tick(&sync).await;
        }

        assert!(!sync.is_halted());
        assert!(fault_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_discards_in_flight_response() {
        let transport = GatedTransport { gate: Notify::new() };
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);

        sync.unsubscribe("agent-1", SubjectKind::Agent);
        sync.inner.transport.gate.notify_one();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(events.try_recv().is_err(), "late response must be discarded");
        assert!(!sync.is_watching("agent-1", SubjectKind::Agent));
    }

    #[tokio::test]
    async fn in_flight_check_is_never_doubled() {
        let transport = GatedTransport { gate: Notify::new() };
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        // The first check is parked on the gate; ticks must not stack a
        // second one behind it.
        assert!(sync.tick().is_empty());
        assert!(sync.tick().is_empty());
        assert_eq!(sync.stats().checks, 1);

        sync.inner.transport.gate.notify_one();
        let received = events.recv_async().await.expect("gated check completes");
        assert_eq!(received.subject_id, "agent-1");

        // Completed check re-arms the subject for the next tick.
        sync.inner.transport.gate.notify_one();
        assert_eq!(sync.tick().len(), 1);
    }

    #[tokio::test]
    async fn push_events_feed_the_same_reducer() {
        let transport = ScriptedTransport::new(vec![Ok(payload("training"))]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        drop(events.recv_async().await.expect("poll delivery"));

        sync.ingest(event("agent-1", crate::status::TrainingStatus::Training));
        let pushed = events.recv_async().await.expect("push delivery");
        assert_eq!(pushed.status, crate::status::TrainingStatus::Training);

        sync.ingest(event("agent-1", crate::status::TrainingStatus::Completed));
        let terminal = events.recv_async().await.expect("terminal push");
        assert!(terminal.status.is_terminal());
        assert!(!sync.is_watching("agent-1", SubjectKind::Agent));

        // Duplicate terminal delivery after removal is dropped.
        sync.ingest(event("agent-1", crate::status::TrainingStatus::Completed));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_replaces_registration() {
        let transport = ScriptedTransport::new(vec![Ok(payload("training"))]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (first_callback, first_events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, first_callback);
        let (second_callback, second_events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, second_callback);

        assert_eq!(sync.stats().active_subscriptions, 1);

        sync.ingest(event("agent-1", crate::status::TrainingStatus::Training));
        assert!(second_events.try_recv().is_ok());
        // Anything the first callback got came from its own pre-replacement
        // check; the ingest above must not reach it.
        let first_total = first_events.try_iter().count();
        assert!(first_total <= 1);
    }

    #[tokio::test]
    async fn missing_credential_makes_subscribe_a_noop() {
        let transport = ScriptedTransport::new(vec![Ok(payload("training"))]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(None), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);

        let stats = sync.stats();
        assert_eq!(stats.active_subscriptions, 0);
        assert_eq!(stats.tickers_started, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_noop_tick() {
        let transport = ScriptedTransport::new(vec![
            Ok(payload("training")),
            Err(TransportError::Malformed("progress was a string".to_string())),
            Ok(payload("training")),
        ]);
        let (fault_tx, _fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        drop(events.recv_async().await.expect("first delivery"));

        run_tick(&sync).await;
        assert!(events.try_recv().is_err(), "malformed payload delivers nothing");
        assert!(sync.is_watching("agent-1", SubjectKind::Agent));

        run_tick(&sync).await;
        assert!(events.try_recv().is_ok(), "polling resumed after the bad payload");
    }

    #[tokio::test]
    async fn transient_errors_are_retried_silently() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("connection refused".to_string())),
            Err(TransportError::Http(503)),
            Ok(payload("Active")),
        ]);
        let (fault_tx, fault_rx) = flume::unbounded();
        let sync =
            StatusSynchronizer::new(transport, StaticToken(Some("t")), SyncSettings::default(), fault_tx);

        let (callback, events) = collector();
        sync.subscribe("agent-1", SubjectKind::Agent, callback);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        run_tick(&sync).await;
        run_tick(&sync).await;

        let delivered = events.recv_async().await.expect("eventual delivery");
        assert!(delivered.status.is_terminal());
        assert!(fault_rx.try_recv().is_err());
    }
}
