//! Slow handlers only hold up what they must.

use async_trait::async_trait;
use parley_core::capability::{
    Action, ActionContext, ActionOutcome, ArgumentSchema, Arguments, CapabilityEntry,
    CapabilityRegistry, Handler, Trigger, TriggerMatch,
};
use parley_core::error::CapabilityError;
use parley_core::event::{Event, EventKind, EventPayload};
use parley_core::value::ValueType;
use parley_core::Version;
use parley_dispatch::{DispatchConfig, Dispatcher, DispatcherState};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

type Seen = Arc<Mutex<Vec<i64>>>;

fn tick(source: &str, n: i64) -> Event {
    Event::new(
        source,
        EventPayload::Custom {
            kind: "tick".into(),
            data: json!(n),
        },
    )
}

/// Routes `n == 0` to `hold` and everything else to `record`. Events from
/// the `slow` source wait on the gate before answering.
struct Route {
    gate: Arc<Notify>,
}

#[async_trait]
impl Trigger for Route {
    async fn inspect(&self, event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
        if event.source == "slow" {
            self.gate.notified().await;
            return Ok(None);
        }
        let EventPayload::Custom { data, .. } = &event.payload else {
            return Ok(None);
        };
        let action = if data.as_i64() == Some(0) { "hold" } else { "record" };
        Ok(Some(TriggerMatch::action(action).arg("n", data.clone())))
    }
}

struct Record {
    seen: Seen,
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
        self.seen
            .lock()
            .unwrap()
            .push(arguments["n"].as_i64().unwrap_or_default());
        Ok(ActionOutcome::done())
    }
}

struct Hold {
    gate: Arc<Notify>,
}

#[async_trait]
impl Action for Hold {
    async fn invoke(
        &self,
        _arguments: Arguments,
        _ctx: ActionContext,
    ) -> Result<ActionOutcome, CapabilityError> {
        self.gate.notified().await;
        Ok(ActionOutcome::done())
    }
}

async fn setup() -> (Dispatcher, Seen, Arc<Notify>) {
    let registry = Arc::new(CapabilityRegistry::new());
    let seen: Seen = Arc::default();
    let gate = Arc::new(Notify::new());
    let v1 = Version::new(1, 0, 0);

    registry
        .register(CapabilityEntry::new(
            "record",
            v1.clone(),
            "sink",
            Handler::Action(Arc::new(Record { seen: seen.clone() })),
        ))
        .await
        .unwrap();
    registry
        .register(CapabilityEntry::new(
            "hold",
            v1,
            "sink",
            Handler::Action(Arc::new(Hold { gate: gate.clone() })),
        ))
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(
        registry,
        DispatchConfig {
            handler_timeout: Duration::from_secs(60),
            ..DispatchConfig::default()
        },
    );
    dispatcher.subscribe(
        EventKind::Custom("tick".into()),
        "router",
        "router.route",
        Arc::new(Route { gate: gate.clone() }),
        0,
    );
    (dispatcher, seen, gate)
}

/// Actions run as separate tasks, so only the set of values is compared.
async fn wait_for(seen: &Seen, expected: &[i64]) {
    let sorted = || {
        let mut values = seen.lock().unwrap().clone();
        values.sort_unstable();
        values
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while sorted() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deliveries did not arrive");
}

#[tokio::test]
async fn blocked_source_does_not_stall_others() {
    let (dispatcher, seen, gate) = setup().await;

    dispatcher.publish(tick("slow", 7)).unwrap();
    dispatcher.publish(tick("fast", 1)).unwrap();
    dispatcher.publish(tick("fast", 2)).unwrap();

    wait_for(&seen, &[1, 2]).await;
    assert_eq!(dispatcher.state(), DispatcherState::Dispatching);

    gate.notify_one();
    dispatcher.wait_idle().await;
    assert_eq!(dispatcher.state(), DispatcherState::Idle);
    assert_eq!(dispatcher.delivered(), 3);
}

#[tokio::test]
async fn running_action_does_not_stall_its_source() {
    let (dispatcher, seen, gate) = setup().await;

    dispatcher.publish(tick("fast", 0)).unwrap();
    dispatcher.publish(tick("fast", 1)).unwrap();
    dispatcher.publish(tick("fast", 2)).unwrap();

    wait_for(&seen, &[1, 2]).await;
    assert_eq!(dispatcher.state(), DispatcherState::Dispatching);

    gate.notify_one();
    dispatcher.wait_idle().await;
    assert_eq!(dispatcher.state(), DispatcherState::Idle);
}

#[tokio::test]
async fn shutdown_deadline_aborts_held_action() {
    let (dispatcher, _seen, _gate) = setup().await;

    dispatcher.publish(tick("fast", 0)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatcher.delivered() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let report = dispatcher.shutdown(Duration::from_millis(50)).await;
    assert_eq!(report.dropped, 0);
    assert_eq!(report.aborted_actions, 1);
    assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    assert!(dispatcher.publish(tick("fast", 1)).is_err());
}
