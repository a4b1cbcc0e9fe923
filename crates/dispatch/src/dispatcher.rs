//! The event dispatcher.
//!
//! Every source (one platform connection) gets its own worker task fed by an
//! unbounded queue, so events from one source are delivered in publish order
//! while sources never wait on each other. A worker that sees no events for
//! [`DispatchConfig::source_idle`] retires; the next event from its source
//! starts a new one. For each event the worker walks
//! the subscriptions for its kind tier by tier (same priority = same tier).
//! Triggers in a tier are awaited together; matches spawn their action as a
//! tracked task. A tier containing a consuming match ends delivery.
//!
//! Handler errors, panics, and timeouts are isolated: they are logged,
//! attributed to the owning extension, and broadcast on [`Dispatcher::failures`].

use futures::FutureExt;
use futures::future::join_all;
use parley_core::capability::{
    ActionContext, CapabilityKind, CapabilityRegistry, Trigger, TriggerMatch,
};
use parley_core::error::{CapabilityError, DispatchError};
use parley_core::event::{Event, EventKind};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::subscription::{Subscription, SubscriptionHandle, SubscriptionInfo, SubscriptionTable};

/// Dispatcher limits.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget for a single trigger inspection or action invocation
    pub handler_timeout: Duration,

    /// Capacity of the failure broadcast channel
    pub failure_buffer: usize,

    /// How long a source worker waits for events before retiring
    pub source_idle: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            failure_buffer: 256,
            source_idle: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Accepting events, nothing in flight
    Idle,
    /// Accepting events, deliveries or actions in flight
    Dispatching,
    /// Rejecting new events, finishing queued ones
    Draining,
    Stopped,
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Dispatching => f.write_str("dispatching"),
            Self::Draining => f.write_str("draining"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

const ACCEPTING: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;

/// An isolated handler failure.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Extension the failure is attributed to
    pub extension: String,

    /// Capability that failed (or that a trigger tried to bind)
    pub capability: String,

    pub kind: CapabilityKind,

    /// Event being delivered when it happened
    pub event_id: String,

    pub error: CapabilityError,
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} '{}' of '{}': {}",
            self.kind,
            self.error.kind_name(),
            self.capability,
            self.extension,
            self.error
        )
    }
}

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Events delivered after draining began
    pub drained: u64,

    /// Events still queued or mid-delivery at the deadline
    pub dropped: usize,

    /// Actions cancelled at the deadline
    pub aborted_actions: usize,
}

/// Queue of a live source worker.
struct SourceQueue {
    worker: u64,
    events: mpsc::UnboundedSender<Arc<Event>>,
}

struct Shared {
    registry: Arc<CapabilityRegistry>,
    config: DispatchConfig,
    subscriptions: SubscriptionTable,
    sources: Mutex<HashMap<String, SourceQueue>>,
    next_worker: AtomicU64,
    state: AtomicU8,
    pending_events: AtomicUsize,
    inflight_actions: AtomicUsize,
    delivered: AtomicU64,
    quiescent: Notify,
    hard_stop: CancellationToken,
    tasks: TaskTracker,
    failures: broadcast::Sender<HandlerFailure>,
}

/// Routes events from platform extensions to triggers and on to actions.
///
/// Cheap to clone; clones share one dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, config: DispatchConfig) -> Self {
        let (failures, _) = broadcast::channel(config.failure_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                registry,
                config,
                subscriptions: SubscriptionTable::default(),
                sources: Mutex::new(HashMap::new()),
                next_worker: AtomicU64::new(0),
                state: AtomicU8::new(ACCEPTING),
                pending_events: AtomicUsize::new(0),
                inflight_actions: AtomicUsize::new(0),
                delivered: AtomicU64::new(0),
                quiescent: Notify::new(),
                hard_stop: CancellationToken::new(),
                tasks: TaskTracker::new(),
                failures,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.shared.registry
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Queue an event for delivery.
    ///
    /// Returns once the event is queued; delivery is asynchronous. Events of
    /// a kind nobody subscribes to are discarded immediately.
    pub fn publish(&self, event: Event) -> Result<(), DispatchError> {
        self.shared.publish(event)
    }

    /// Subscribe a trigger to one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        owner: &str,
        capability: &str,
        trigger: Arc<dyn Trigger>,
        priority: i32,
    ) -> SubscriptionHandle {
        let handle =
            self.shared
                .subscriptions
                .insert(kind.clone(), owner, capability, trigger, priority);
        debug!(
            extension = %owner,
            capability = %capability,
            kind = %kind,
            priority,
            handle = %handle,
            "Subscribed trigger"
        );
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<SubscriptionInfo, DispatchError> {
        let info = self
            .shared
            .subscriptions
            .remove(handle)
            .ok_or(DispatchError::UnknownSubscription(handle.id()))?;
        debug!(extension = %info.owner, capability = %info.capability, "Unsubscribed trigger");
        Ok(info)
    }

    /// Drop every subscription owned by `owner`. Returns the number removed.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        self.shared.subscriptions.remove_owner(owner)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.shared.subscriptions.list()
    }

    /// A receiver for handler failures from now on.
    pub fn failures(&self) -> broadcast::Receiver<HandlerFailure> {
        self.shared.failures.subscribe()
    }

    /// Number of sources with a live worker.
    pub fn active_sources(&self) -> usize {
        self.shared
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Total events fully delivered since start.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Wait until no event is queued and no action is running.
    pub async fn wait_idle(&self) {
        self.shared.wait_quiescent().await;
    }

    /// Stop accepting events and drain.
    ///
    /// Queued events keep being delivered until `deadline`; whatever is left
    /// then is dropped and counted. Calling it again after the dispatcher has
    /// stopped returns an empty report.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let shared = &self.shared;
        {
            let mut sources = shared.sources.lock().unwrap_or_else(|e| e.into_inner());
            if shared.state.load(Ordering::SeqCst) == STOPPED {
                return ShutdownReport::default();
            }
            shared.state.store(DRAINING, Ordering::SeqCst);
            // Workers exit once their queue is empty.
            sources.clear();
        }

        let start = shared.delivered.load(Ordering::SeqCst);
        info!(
            pending = shared.pending_events.load(Ordering::SeqCst),
            inflight = shared.inflight_actions.load(Ordering::SeqCst),
            deadline_ms = deadline.as_millis() as u64,
            "Draining dispatcher"
        );

        let mut report = ShutdownReport::default();
        if tokio::time::timeout(deadline, shared.wait_quiescent()).await.is_err() {
            report.dropped = shared.pending_events.load(Ordering::SeqCst);
            report.aborted_actions = shared.inflight_actions.load(Ordering::SeqCst);
            shared.hard_stop.cancel();
            warn!(
                dropped = report.dropped,
                aborted_actions = report.aborted_actions,
                "Shutdown deadline reached"
            );
        }

        shared.tasks.close();
        shared.tasks.wait().await;
        shared.state.store(STOPPED, Ordering::SeqCst);
        report.drained = shared.delivered.load(Ordering::SeqCst) - start;
        info!(drained = report.drained, dropped = report.dropped, "Dispatcher stopped");
        report
    }
}

impl Shared {
    fn state(&self) -> DispatcherState {
        match self.state.load(Ordering::SeqCst) {
            ACCEPTING if self.is_quiescent() => DispatcherState::Idle,
            ACCEPTING => DispatcherState::Dispatching,
            DRAINING => DispatcherState::Draining,
            _ => DispatcherState::Stopped,
        }
    }

    fn is_quiescent(&self) -> bool {
        self.pending_events.load(Ordering::SeqCst) == 0
            && self.inflight_actions.load(Ordering::SeqCst) == 0
    }

    async fn wait_quiescent(&self) {
        loop {
            let notified = self.quiescent.notified();
            if self.is_quiescent() {
                return;
            }
            notified.await;
        }
    }

    fn settle(&self, counter: &AtomicUsize) {
        counter.fetch_sub(1, Ordering::SeqCst);
        if self.is_quiescent() {
            self.quiescent.notify_waiters();
        }
    }

    fn publish(self: &Arc<Self>, event: Event) -> Result<(), DispatchError> {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        if self.state.load(Ordering::SeqCst) != ACCEPTING {
            return Err(DispatchError::ShuttingDown);
        }

        let kind = event.kind();
        if !self.subscriptions.has_subscribers(&kind) {
            trace!(kind = %kind, source = %event.source, "No subscribers; event discarded");
            return Ok(());
        }

        let source = event.source.clone();
        let mut event = Arc::new(event);
        self.pending_events.fetch_add(1, Ordering::SeqCst);

        if let Some(queue) = sources.get(&source) {
            match queue.events.send(event) {
                Ok(()) => return Ok(()),
                // The worker is gone; start a fresh one below.
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
        }

        let queue = self.spawn_worker(&source);
        if queue.events.send(event).is_err() {
            self.settle(&self.pending_events);
            return Err(DispatchError::ShuttingDown);
        }
        sources.insert(source, queue);
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, source: &str) -> SourceQueue {
        let (queue, mut events) = mpsc::unbounded_channel::<Arc<Event>>();
        let worker = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();
        let source = source.to_string();

        self.tasks.spawn(async move {
            debug!(source = %source, worker, "Source worker started");
            let idle = shared.config.source_idle;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shared.hard_stop.cancelled() => break,
                    next = tokio::time::timeout(idle, events.recv()) => match next {
                        Ok(Some(event)) => event,
                        Ok(None) => break,
                        Err(_) => match shared.retire(&source, worker, &mut events) {
                            Some(event) => event,
                            None => break,
                        },
                    },
                };
                tokio::select! {
                    biased;
                    _ = shared.hard_stop.cancelled() => break,
                    _ = shared.deliver(event) => {}
                }
                shared.delivered.fetch_add(1, Ordering::SeqCst);
                shared.settle(&shared.pending_events);
            }
            debug!(source = %source, worker, "Source worker stopped");
        });
        SourceQueue {
            worker,
            events: queue,
        }
    }

    /// Unregister an idle worker's queue, unless an event arrived meanwhile.
    ///
    /// `publish` sends while holding the sources lock, so once the queue is
    /// found empty under that lock no event can be lost.
    fn retire(
        &self,
        source: &str,
        worker: u64,
        events: &mut mpsc::UnboundedReceiver<Arc<Event>>,
    ) -> Option<Arc<Event>> {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(event) = events.try_recv() {
            return Some(event);
        }
        if sources.get(source).is_some_and(|q| q.worker == worker) {
            sources.remove(source);
            trace!(source, worker, "Idle source worker retired");
        }
        None
    }

    async fn deliver(self: &Arc<Self>, event: Arc<Event>) {
        let subscriptions = self.subscriptions.snapshot(&event.kind());
        let mut rest = subscriptions.as_slice();

        while let Some(first) = rest.first() {
            let tier_len = rest
                .iter()
                .position(|s| s.info.priority != first.info.priority)
                .unwrap_or(rest.len());
            let (tier, next) = rest.split_at(tier_len);
            rest = next;

            let results = join_all(tier.iter().map(|s| self.inspect(s, &event))).await;

            let mut consumed = false;
            for (subscription, result) in tier.iter().zip(results) {
                match result {
                    Ok(Some(matched)) => {
                        consumed |= matched.consume;
                        self.spawn_action(subscription, matched, event.clone());
                    }
                    Ok(None) => {}
                    Err(error) => self.report(HandlerFailure {
                        extension: subscription.info.owner.clone(),
                        capability: subscription.info.capability.clone(),
                        kind: CapabilityKind::Trigger,
                        event_id: event.id.clone(),
                        error,
                    }),
                }
            }

            if consumed {
                trace!(event = %event.id, priority = first.info.priority, "Event consumed");
                break;
            }
        }
    }

    async fn inspect(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<Option<TriggerMatch>, CapabilityError> {
        let capability = &subscription.info.capability;
        let inspection = AssertUnwindSafe(subscription.trigger.inspect(event)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout, inspection).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CapabilityError::Panicked {
                capability: capability.clone(),
            }),
            Err(_) => Err(CapabilityError::Timeout {
                capability: capability.clone(),
                timeout_ms: self.config.handler_timeout.as_millis() as u64,
            }),
        }
    }

    fn spawn_action(self: &Arc<Self>, subscription: &Subscription, matched: TriggerMatch, event: Arc<Event>) {
        self.inflight_actions.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();
        let invoker = subscription.info.owner.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = shared.hard_stop.cancelled() => {}
                _ = shared.run_action(invoker, matched, event) => {}
            }
            shared.settle(&shared.inflight_actions);
        });
    }

    async fn run_action(self: &Arc<Self>, invoker: String, matched: TriggerMatch, event: Arc<Event>) {
        let TriggerMatch {
            action,
            requirement,
            arguments,
            ..
        } = matched;

        // A binding that names no action is the trigger's fault.
        let entry = match self
            .registry
            .lookup(&action, &requirement, CapabilityKind::Action)
            .await
        {
            Ok(entry) => entry,
            Err(error) => {
                self.report(HandlerFailure {
                    extension: invoker,
                    capability: action,
                    kind: CapabilityKind::Action,
                    event_id: event.id.clone(),
                    error,
                });
                return;
            }
        };

        let ctx = ActionContext {
            invoker: Some(invoker.clone()),
            event: Some(event.clone()),
            cancel: self.hard_stop.child_token(),
        };
        let invocation =
            AssertUnwindSafe(CapabilityRegistry::invoke_entry(&entry, arguments, ctx)).catch_unwind();

        let result = match tokio::time::timeout(self.config.handler_timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CapabilityError::Panicked {
                capability: entry.name.clone(),
            }),
            Err(_) => Err(CapabilityError::Timeout {
                capability: entry.name.clone(),
                timeout_ms: self.config.handler_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(outcome) => {
                for follow_up in outcome.events {
                    if let Err(e) = self.publish(follow_up) {
                        debug!(capability = %entry.name, error = %e, "Follow-up event rejected");
                    }
                }
            }
            Err(error) => {
                let extension = match error {
                    // Malformed arguments come from the trigger's binding.
                    CapabilityError::InvalidArguments { .. } => invoker,
                    _ => entry.owner.clone(),
                };
                self.report(HandlerFailure {
                    extension,
                    capability: entry.name.clone(),
                    kind: CapabilityKind::Action,
                    event_id: event.id.clone(),
                    error,
                });
            }
        }
    }

    fn report(&self, failure: HandlerFailure) {
        warn!(
            extension = %failure.extension,
            capability = %failure.capability,
            kind = %failure.kind,
            error_kind = failure.error.kind_name(),
            error = %failure.error,
            "Handler failed"
        );
        // No receivers is fine.
        let _ = self.failures.send(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::DEFAULT_PRIORITY;
    use async_trait::async_trait;
    use parley_core::capability::{
        Action, ActionOutcome, ArgumentSchema, Arguments, CapabilityEntry, Handler,
    };
    use parley_core::event::EventPayload;
    use parley_core::value::ValueType;
    use parley_core::Version;
    use serde_json::json;

    fn custom(source: &str, n: i64) -> Event {
        Event::new(
            source,
            EventPayload::Custom {
                kind: "tick".into(),
                data: json!(n),
            },
        )
    }

    fn tick() -> EventKind {
        EventKind::Custom("tick".into())
    }

    /// Matches every event, binding its `data` as `n`.
    struct Bind {
        action: &'static str,
        consume: bool,
    }

    #[async_trait]
    impl Trigger for Bind {
        async fn inspect(&self, event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
            let EventPayload::Custom { data, .. } = &event.payload else {
                return Ok(None);
            };
            let mut matched = TriggerMatch::action(self.action).arg("n", data.clone());
            if self.consume {
                matched = matched.consume();
            }
            Ok(Some(matched))
        }
    }

    struct Failing;

    #[async_trait]
    impl Trigger for Failing {
        async fn inspect(&self, _event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
            Err(CapabilityError::failed("failing", "boom"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Trigger for Panicking {
        async fn inspect(&self, _event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
            panic!("trigger blew up");
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Trigger for Sleepy {
        async fn inspect(&self, _event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    /// Records every `n` it is invoked with.
    struct Record {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl Action for Record {
        fn schema(&self) -> ArgumentSchema {
            ArgumentSchema::new().required("n", ValueType::Int)
        }

        async fn invoke(
            &self,
            arguments: Arguments,
            _ctx: ActionContext,
        ) -> Result<ActionOutcome, CapabilityError> {
            let n = arguments["n"].as_i64().unwrap_or_default();
            self.seen.lock().unwrap().push(n);
            Ok(ActionOutcome::done())
        }
    }

    async fn setup(config: DispatchConfig) -> (Dispatcher, Arc<Mutex<Vec<i64>>>) {
        let registry = Arc::new(CapabilityRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(CapabilityEntry::new(
                "record",
                Version::new(1, 0, 0),
                "recorder",
                Handler::Action(Arc::new(Record { seen: seen.clone() })),
            ))
            .await
            .unwrap();
        (Dispatcher::new(registry, config), seen)
    }

    fn bind(action: &'static str, consume: bool) -> Arc<dyn Trigger> {
        Arc::new(Bind { action, consume })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let (dispatcher, seen) = setup(DispatchConfig::default()).await;
        dispatcher.publish(custom("irc", 1)).unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(dispatcher.delivered(), 0);
    }

    #[tokio::test]
    async fn consuming_trigger_hides_event_from_lower_priority() {
        let (dispatcher, seen) = setup(DispatchConfig::default()).await;
        let mut failures = dispatcher.failures();
        dispatcher.subscribe(tick(), "high", "high.t", bind("record", true), 10);
        // Would fail loudly if it ever ran.
        dispatcher.subscribe(tick(), "low", "low.t", Arc::new(Failing), 5);

        dispatcher.publish(custom("irc", 7)).unwrap();
        dispatcher.wait_idle().await;

        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn failures_are_isolated_and_attributed() {
        let (dispatcher, seen) = setup(DispatchConfig::default()).await;
        let mut failures = dispatcher.failures();
        dispatcher.subscribe(tick(), "bad", "bad.fail", Arc::new(Failing), DEFAULT_PRIORITY);
        dispatcher.subscribe(tick(), "worse", "worse.panic", Arc::new(Panicking), DEFAULT_PRIORITY);
        dispatcher.subscribe(tick(), "good", "good.bind", bind("record", false), DEFAULT_PRIORITY);

        dispatcher.publish(custom("irc", 1)).unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        let mut reported = Vec::new();
        while let Ok(failure) = failures.try_recv() {
            reported.push((failure.extension, failure.error.kind_name()));
        }
        reported.sort();
        assert_eq!(
            reported,
            vec![("bad".to_string(), "handler_failed"), ("worse".to_string(), "panicked")]
        );
    }

    #[tokio::test]
    async fn events_from_one_source_are_delivered_in_order() {
        let (dispatcher, _seen) = setup(DispatchConfig::default()).await;

        struct Observe(Arc<Mutex<Vec<(String, i64)>>>);
        #[async_trait]
        impl Trigger for Observe {
            async fn inspect(&self, event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
                if let EventPayload::Custom { data, .. } = &event.payload {
                    tokio::task::yield_now().await;
                    let n = data.as_i64().unwrap_or_default();
                    self.0.lock().unwrap().push((event.source.clone(), n));
                }
                Ok(None)
            }
        }

        let observed = Arc::new(Mutex::new(Vec::new()));
        dispatcher.subscribe(tick(), "t", "t.observe", Arc::new(Observe(observed.clone())), 0);

        for n in 0..50 {
            dispatcher.publish(custom("irc", n)).unwrap();
            dispatcher.publish(custom("discord", n)).unwrap();
        }
        dispatcher.wait_idle().await;

        let observed = observed.lock().unwrap().clone();
        for source in ["irc", "discord"] {
            let order: Vec<i64> = observed
                .iter()
                .filter(|(s, _)| s == source)
                .map(|(_, n)| *n)
                .collect();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }
        assert_eq!(dispatcher.delivered(), 100);
    }

    #[tokio::test]
    async fn malformed_binding_names_capability_and_constraint() {
        let (dispatcher, _seen) = setup(DispatchConfig::default()).await;
        let mut failures = dispatcher.failures();

        struct BadArgs;
        #[async_trait]
        impl Trigger for BadArgs {
            async fn inspect(&self, _event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
                Ok(Some(TriggerMatch::action("record").arg("n", "seven")))
            }
        }
        dispatcher.subscribe(tick(), "binder", "binder.t", Arc::new(BadArgs), 0);

        dispatcher.publish(custom("irc", 1)).unwrap();
        dispatcher.wait_idle().await;

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.extension, "binder");
        match failure.error {
            CapabilityError::InvalidArguments { capability, constraint } => {
                assert_eq!(capability, "record");
                assert!(constraint.contains("'n'"));
            }
            other => panic!("expected InvalidArguments, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_trigger_times_out() {
        let (dispatcher, seen) = setup(DispatchConfig {
            handler_timeout: Duration::from_millis(100),
            failure_buffer: 8,
            ..DispatchConfig::default()
        })
        .await;
        let mut failures = dispatcher.failures();
        dispatcher.subscribe(tick(), "slow", "slow.t", Arc::new(Sleepy), 0);
        dispatcher.subscribe(tick(), "fast", "fast.t", bind("record", false), 0);

        dispatcher.publish(custom("irc", 3)).unwrap();
        dispatcher.wait_idle().await;

        assert_eq!(*seen.lock().unwrap(), vec![3]);
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.extension, "slow");
        assert!(matches!(failure.error, CapabilityError::Timeout { timeout_ms: 100, .. }));
    }

    #[tokio::test]
    async fn follow_up_events_are_published() {
        let (dispatcher, seen) = setup(DispatchConfig::default()).await;

        struct Relay;
        #[async_trait]
        impl Action for Relay {
            async fn invoke(
                &self,
                arguments: Arguments,
                _ctx: ActionContext,
            ) -> Result<ActionOutcome, CapabilityError> {
                let n = arguments["n"].as_i64().unwrap_or_default();
                Ok(ActionOutcome::done().emit(Event::new(
                    "relay",
                    EventPayload::Custom {
                        kind: "relayed".into(),
                        data: json!(n * 10),
                    },
                )))
            }
        }
        dispatcher
            .registry()
            .register(CapabilityEntry::new(
                "relay",
                Version::new(1, 0, 0),
                "relay",
                Handler::Action(Arc::new(Relay)),
            ))
            .await
            .unwrap();

        dispatcher.subscribe(tick(), "a", "a.t", bind("relay", false), 0);
        dispatcher.subscribe(EventKind::Custom("relayed".into()), "b", "b.t", bind("record", false), 0);

        dispatcher.publish(custom("irc", 4)).unwrap();
        // The follow-up is queued before the first action settles.
        dispatcher.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), vec![40]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (dispatcher, seen) = setup(DispatchConfig::default()).await;
        let handle = dispatcher.subscribe(tick(), "t", "t.bind", bind("record", false), 0);
        dispatcher.unsubscribe(handle).unwrap();
        assert_eq!(
            dispatcher.unsubscribe(handle).unwrap_err(),
            DispatchError::UnknownSubscription(handle.id())
        );

        dispatcher.publish(custom("irc", 1)).unwrap();
        dispatcher.wait_idle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn draining_rejects_publish_and_delivers_queue() {
        let (dispatcher, seen) = setup(DispatchConfig::default()).await;
        dispatcher.subscribe(tick(), "t", "t.bind", bind("record", false), 0);
        for n in 0..5 {
            dispatcher.publish(custom("irc", n)).unwrap();
        }

        let report = dispatcher.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.dropped, 0);
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(
            dispatcher.publish(custom("irc", 9)).unwrap_err(),
            DispatchError::ShuttingDown
        );
        assert_eq!(dispatcher.shutdown(Duration::from_secs(1)).await, ShutdownReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_drops_and_counts_remaining_events() {
        let (dispatcher, _seen) = setup(DispatchConfig {
            handler_timeout: Duration::from_secs(3600 * 2),
            failure_buffer: 8,
            ..DispatchConfig::default()
        })
        .await;
        dispatcher.subscribe(tick(), "slow", "slow.t", Arc::new(Sleepy), 0);
        for n in 0..3 {
            dispatcher.publish(custom("irc", n)).unwrap();
        }

        let report = dispatcher.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.dropped, 3);
        assert_eq!(report.drained, 0);
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_workers_retire_and_restart() {
        let (dispatcher, seen) = setup(DispatchConfig {
            source_idle: Duration::from_secs(60),
            ..DispatchConfig::default()
        })
        .await;
        dispatcher.subscribe(tick(), "rec", "rec.bind", bind("record", false), 0);

        dispatcher.publish(custom("irc", 1)).unwrap();
        dispatcher.publish(custom("discord", 2)).unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.active_sources(), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(dispatcher.active_sources(), 0);

        dispatcher.publish(custom("irc", 3)).unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.active_sources(), 1);

        let mut values = seen.lock().unwrap().clone();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(dispatcher.delivered(), 3);
    }
}
