//! `echo`: replies with whatever follows the command prefix.
//!
//! Works on any platform: replies go out through `ExtensionContext::send`,
//! which picks the chat's own `<platform>.send` action. Each chat keeps an
//! echo counter in its extension data, readable through `echo.stats`.

use async_trait::async_trait;
use parley_core::capability::{
    Accessor, Action, ActionContext, ActionOutcome, ArgumentSchema, Arguments, Trigger,
    TriggerMatch,
};
use parley_core::entity::{ChatId, MessageId};
use parley_core::error::CapabilityError;
use parley_core::event::{Event, EventKind};
use parley_core::value::ValueType;
use parley_extensions::{Extension, ExtensionContext};
use semver::{Comparator, Op, Prerelease, Version, VersionReq};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

const COMMAND: &str = "echo.command";
const REPLY: &str = "echo.reply";
const STATS: &str = "echo.stats";

pub struct Echo;

#[async_trait]
impl Extension for Echo {
    async fn load(&self, ctx: &Arc<ExtensionContext>) -> parley_core::Result<()> {
        let v1 = Version::new(1, 0, 0);
        ctx.register_trigger(COMMAND, v1.clone(), Arc::new(Command { ctx: ctx.clone() }))?;
        ctx.register_action(REPLY, v1.clone(), Arc::new(Reply { ctx: ctx.clone() }))?;
        ctx.register_accessor(STATS, v1, Arc::new(Stats { ctx: ctx.clone() }))?;
        ctx.subscribe(EventKind::MessageReceived, COMMAND, 0)
    }
}

/// `^1` for `echo.reply`.
fn reply_requirement() -> VersionReq {
    VersionReq {
        comparators: vec![Comparator {
            op: Op::Caret,
            major: 1,
            minor: None,
            patch: None,
            pre: Prerelease::EMPTY,
        }],
    }
}

fn echo_count(data: Option<Value>) -> u64 {
    data.as_ref()
        .and_then(|d| d.get("echoes"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

// ── echo.command ────────────────────────────────────────────────────────────

struct Command {
    ctx: Arc<ExtensionContext>,
}

#[async_trait]
impl Trigger for Command {
    async fn inspect(&self, event: &Event) -> Result<Option<TriggerMatch>, CapabilityError> {
        let Some(message) = event.message() else {
            return Ok(None);
        };

        let me = self
            .ctx
            .store()
            .self_user()
            .await
            .map_err(|e| CapabilityError::failed(COMMAND, e))?;
        if message.sender == me.id {
            return Ok(None);
        }

        let prefix = self
            .ctx
            .setting("prefix")
            .await
            .map_err(|e| CapabilityError::failed(COMMAND, e))?;
        let prefix = prefix.as_str().unwrap_or_default();
        let Some(rest) = message.content.raw.strip_prefix(prefix) else {
            return Ok(None);
        };
        let text = rest.trim();
        if text.is_empty() {
            return Ok(None);
        }

        debug!(chat = %message.chat, "Echo command matched");
        Ok(Some(
            TriggerMatch::action(REPLY)
                .version(reply_requirement())
                .arg("chat", message.chat.as_str())
                .arg("text", text)
                .arg("reply_to", message.id.as_str())
                .consume(),
        ))
    }
}

// ── echo.reply ──────────────────────────────────────────────────────────────

struct Reply {
    ctx: Arc<ExtensionContext>,
}

#[async_trait]
impl Action for Reply {
    fn schema(&self) -> ArgumentSchema {
        ArgumentSchema::new()
            .required("chat", ValueType::String)
            .required("text", ValueType::String)
            .optional("reply_to", ValueType::String)
    }

    async fn invoke(
        &self,
        arguments: Arguments,
        _ctx: ActionContext,
    ) -> Result<ActionOutcome, CapabilityError> {
        let chat = ChatId(
            arguments
                .get("chat")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        );
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let reply_to = arguments
            .get("reply_to")
            .and_then(Value::as_str)
            .map(|id| MessageId(id.to_string()));

        self.ctx
            .send(&chat, text, reply_to.as_ref())
            .await
            .map_err(|e| CapabilityError::failed(REPLY, e))?;

        let data = self
            .ctx
            .update_chat_data(&chat, |data| json!({ "echoes": echo_count(data) + 1 }))
            .await
            .map_err(|e| CapabilityError::failed(REPLY, e))?;

        Ok(ActionOutcome::with_output(data))
    }
}

// ── echo.stats ──────────────────────────────────────────────────────────────

/// `{"chat": id}` reads one chat's counter; anything else sums every chat.
struct Stats {
    ctx: Arc<ExtensionContext>,
}

#[async_trait]
impl Accessor for Stats {
    async fn read(&self, query: Value) -> Result<Value, CapabilityError> {
        let failed = |e| CapabilityError::failed(STATS, e);

        if let Some(chat) = query.get("chat").and_then(Value::as_str) {
            let data = self
                .ctx
                .chat_data(&ChatId(chat.to_string()))
                .await
                .map_err(failed)?;
            return Ok(json!({ "echoes": echo_count(data) }));
        }

        let mut total = 0;
        for chat in self.ctx.store().list_chats().await.map_err(failed)? {
            total += echo_count(self.ctx.chat_data(&chat.id).await.map_err(failed)?);
        }
        Ok(json!({ "echoes": total }))
    }
}
