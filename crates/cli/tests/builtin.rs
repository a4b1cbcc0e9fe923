//! The built-in console and echo extensions, booted together.

use parley::builtin::{self, ConsoleIo, console};
use parley_core::entity::{Chat, MessageContent, UserId};
use parley_core::event::{Event, EventPayload};
use parley_core::storage::StorageBackend;
use parley_extensions::{Runtime, RuntimeOptions};
use parley_store::InMemoryBackend;
use semver::VersionReq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    runtime: Runtime,
    output: mpsc::UnboundedReceiver<String>,
    chat: Chat,
    local: UserId,
}

async fn boot() -> Harness {
    boot_on(Arc::new(InMemoryBackend::new())).await
}

async fn boot_on(backend: Arc<dyn StorageBackend>) -> Harness {
    let (tx, output) = mpsc::unbounded_channel();
    let options = RuntimeOptions {
        data_dir: tempfile::tempdir().unwrap().keep(),
        profile_name: Some("parley".into()),
        shutdown_deadline: Duration::from_secs(2),
        ..RuntimeOptions::default()
    };
    let runtime = Runtime::boot(
        backend,
        builtin::catalog_with(ConsoleIo::Captured(tx)).unwrap(),
        options,
    )
    .await
    .unwrap();

    let store = runtime.store();
    let chat = store
        .find_chat(console::PLATFORM, console::CHAT)
        .await
        .unwrap()
        .expect("console chat created on start");
    let local = store
        .find_user_by_identity(console::PLATFORM, console::LOCAL_USER)
        .await
        .unwrap()
        .expect("local user created on start")
        .id;

    Harness {
        runtime,
        output,
        chat,
        local,
    }
}

impl Harness {
    /// Record `text` from `sender` and deliver it like the stdin reader does.
    async fn say(&self, sender: &UserId, text: &str) {
        self.deliver(sender, text).await;
        self.runtime.dispatcher().wait_idle().await;
    }

    async fn deliver(&self, sender: &UserId, text: &str) {
        let message = self
            .runtime
            .store()
            .record_message(sender, &self.chat.id, MessageContent::text(text))
            .await
            .unwrap();
        self.runtime
            .dispatcher()
            .publish(Event::new(
                console::PLATFORM,
                EventPayload::MessageReceived { message },
            ))
            .unwrap();
    }

    async fn echoes(&self) -> serde_json::Value {
        self.runtime
            .capabilities()
            .read(
                "echo.stats",
                &VersionReq::STAR,
                json!({ "chat": self.chat.id.as_str() }),
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn echo_loads_after_the_console_platform() {
    let h = boot().await;
    assert_eq!(h.runtime.report().loaded, vec!["console", "echo"]);
    assert!(h.runtime.report().failures.is_empty());

    let echo = h.runtime.extension("echo").await.unwrap();
    assert_eq!(echo.generation, 1);
    assert!(h.runtime.extension("platform").await.is_some());
}

#[tokio::test]
async fn console_sets_up_chat_and_local_user() {
    let h = boot().await;
    let me = h.runtime.self_user().await.unwrap();

    assert_eq!(h.chat.name.as_deref(), Some(console::CHAT));
    assert!(h.chat.members.contains(&h.local));
    assert!(h.chat.members.contains(&me.id));

    let local = h.runtime.store().user(&h.local).await.unwrap();
    assert!(local.answers_to("you"));
}

#[tokio::test]
async fn echo_command_replies_through_console() {
    let mut h = boot().await;
    h.say(&h.local.clone(), "!echo hello there").await;

    assert_eq!(h.output.try_recv().unwrap(), "parley: hello there");
    assert_eq!(h.echoes().await, json!({ "echoes": 1 }));

    let history = h
        .runtime
        .store()
        .messages_in_chat(&h.chat.id, parley_store::MessageQuery::latest(10))
        .await
        .unwrap();
    let reply = history.last().unwrap();
    assert_eq!(reply.content.raw, "hello there");
    assert_eq!(reply.reply_to.as_ref(), Some(&history[history.len() - 2].id));
}

#[tokio::test]
async fn plain_messages_and_own_messages_are_ignored() {
    let mut h = boot().await;
    let me = h.runtime.self_user().await.unwrap();

    h.say(&h.local.clone(), "just chatting").await;
    h.say(&h.local.clone(), "!echo    ").await;
    h.say(&me.id, "!echo talking to myself").await;

    assert!(h.output.try_recv().is_err());
    assert_eq!(h.echoes().await, json!({ "echoes": 0 }));
}

#[tokio::test]
async fn prefix_setting_applies_without_restart() {
    let mut h = boot().await;
    h.runtime
        .settings()
        .set("echo", "prefix", json!("?say "))
        .await
        .unwrap();

    h.say(&h.local.clone(), "!echo old").await;
    h.say(&h.local.clone(), "?say new").await;

    assert_eq!(h.output.try_recv().unwrap(), "parley: new");
    assert!(h.output.try_recv().is_err());
}

#[tokio::test]
async fn console_send_validates_arguments() {
    let h = boot().await;
    let console = h.runtime.extension("console").await.unwrap();

    let err = console
        .context()
        .invoke("console.send", &VersionReq::STAR, serde_json::Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind_name(), "invalid_arguments");
}

#[tokio::test]
async fn shutdown_drains_cleanly() {
    let h = boot().await;
    h.say(&h.local.clone(), "!echo bye").await;

    let report = h.runtime.shutdown().await;
    assert_eq!(report.dropped, 0);
    assert_eq!(report.aborted_actions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_echoes_are_all_counted_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let backend = parley_store::open("sqlite", &dir.path().join("parley.db").display().to_string())
        .await
        .unwrap();
    let mut h = boot_on(backend).await;

    let local = h.local.clone();
    for n in 0..50 {
        h.deliver(&local, &format!("!echo {n}")).await;
    }
    h.runtime.dispatcher().wait_idle().await;

    assert_eq!(h.echoes().await, json!({ "echoes": 50 }));
    let mut printed = 0;
    while h.output.try_recv().is_ok() {
        printed += 1;
    }
    assert_eq!(printed, 50);
}
