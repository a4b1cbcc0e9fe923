//! `console`: a platform bound to the local terminal.
//!
//! Every line read from stdin is recorded as a message from the local user
//! in the `terminal` chat and published as `MessageReceived`. Outbound sends
//! arrive through `console.send` and are printed. End of input shuts the
//! runtime down.

use async_trait::async_trait;
use parley_core::capability::{Action, ActionContext, ActionOutcome, ArgumentSchema, Arguments};
use parley_core::entity::{ChatId, MessageContent, MessageId, UserId};
use parley_core::error::CapabilityError;
use parley_core::event::{Event, EventPayload};
use parley_core::value::ValueType;
use parley_extensions::{Extension, ExtensionContext};
use semver::Version;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Platform tag of every console entity.
pub const PLATFORM: &str = "console";

/// Native ID of the single console chat.
pub const CHAT: &str = "terminal";

/// Native ID of the person at the terminal.
pub const LOCAL_USER: &str = "local";

const SEND: &str = "console.send";

/// Where console output goes.
#[derive(Debug, Clone)]
pub enum ConsoleIo {
    /// Print to stdout and read lines from stdin
    Terminal,

    /// Forward printed lines to a channel and read nothing
    Captured(mpsc::UnboundedSender<String>),
}

impl ConsoleIo {
    fn write(&self, line: String) {
        match self {
            Self::Terminal => println!("{line}"),
            Self::Captured(tx) => {
                let _ = tx.send(line);
            }
        }
    }
}

pub struct Console {
    io: ConsoleIo,
}

impl Console {
    pub fn new(io: ConsoleIo) -> Self {
        Self { io }
    }
}

#[async_trait]
impl Extension for Console {
    async fn load(&self, ctx: &Arc<ExtensionContext>) -> parley_core::Result<()> {
        ctx.register_action(
            SEND,
            Version::new(1, 0, 0),
            Arc::new(SendAction {
                ctx: ctx.clone(),
                io: self.io.clone(),
            }),
        )
    }

    async fn start(&self, ctx: &Arc<ExtensionContext>) -> parley_core::Result<()> {
        let store = ctx.store();
        let mut chat = store.get_or_create_chat(PLATFORM, CHAT).await?;
        if chat.name.is_none() {
            chat = store.set_chat_name(&chat.id, CHAT).await?;
        }

        let user_name = match ctx.setting("user_name").await? {
            Value::String(name) => name,
            _ => LOCAL_USER.to_string(),
        };
        let user = store.get_or_create_user(PLATFORM, LOCAL_USER).await?;
        store.set_display_name(&user.id, PLATFORM, &user_name).await?;

        let me = store.self_user().await?;
        store.add_member(&chat.id, &user.id).await?;
        store.add_member(&chat.id, &me.id).await?;
        info!(chat = %chat.id, user = %user_name, "Console ready");

        if matches!(self.io, ConsoleIo::Terminal) {
            tokio::spawn(read_stdin(ctx.clone(), chat.id, user.id));
        }
        Ok(())
    }
}

/// Record and publish each stdin line until EOF or shutdown.
async fn read_stdin(ctx: Arc<ExtensionContext>, chat: ChatId, user: UserId) {
    let shutdown = ctx.shutdown_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let message = match ctx
                    .store()
                    .record_message(&user, &chat, MessageContent::text(text))
                    .await
                {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Could not record console input");
                        continue;
                    }
                };
                if let Err(e) = ctx.publish(ctx.event(EventPayload::MessageReceived { message })) {
                    debug!(error = %e, "Console input not delivered");
                    break;
                }
            }
            Ok(None) => {
                info!("Console input closed");
                shutdown.cancel();
                break;
            }
            Err(e) => {
                warn!(error = %e, "Console read failed");
                shutdown.cancel();
                break;
            }
        }
    }
}

// ── console.send ────────────────────────────────────────────────────────────

struct SendAction {
    ctx: Arc<ExtensionContext>,
    io: ConsoleIo,
}

fn string_arg(arguments: &Arguments, name: &str) -> Option<String> {
    arguments.get(name).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl Action for SendAction {
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
        let chat = ChatId(string_arg(&arguments, "chat").unwrap_or_default());
        let text = string_arg(&arguments, "text").unwrap_or_default();
        let reply_to = string_arg(&arguments, "reply_to").map(MessageId);

        let store = self.ctx.store();
        let me = store
            .self_user()
            .await
            .map_err(|e| CapabilityError::failed(SEND, e))?;
        let content = MessageContent::text(&text);
        let message = match &reply_to {
            Some(parent) => store.record_reply(&me.id, &chat, content.clone(), parent).await,
            None => store.record_message(&me.id, &chat, content.clone()).await,
        }
        .map_err(|e| CapabilityError::failed(SEND, e))?;

        self.io.write(format!("{}: {text}", me.name()));

        Ok(
            ActionOutcome::with_output(json!({ "message": message.id.as_str() })).emit(Event::new(
                PLATFORM,
                EventPayload::MessageSent {
                    chat,
                    content,
                    reply_to,
                },
            )),
        )
    }
}
