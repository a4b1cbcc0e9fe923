//! Contexts handed to extensions.
//!
//! [`CoreContext`] is built once per runtime and owns the shared services.
//! Each extension gets an [`ExtensionContext`] scoped to its own name: its
//! settings namespace, its data keys, its storage directory, and the
//! capabilities it may see at its load generation.
//!
//! During `load` the registration methods only stage; the loader commits the
//! staged set once `load` has returned and the manifest declarations check out.

use chrono::{DateTime, Utc};
use parley_config::{SettingSchema, SettingsRegistry, WatchHandle, Watcher};
use parley_core::capability::{
    Accessor, Action, ActionContext, ActionOutcome, Arguments, CapabilityEntry, CapabilityKind,
    CapabilityRegistry, Handler, LoadSlot, Trigger,
};
use parley_core::entity::{ChatId, MessageId, UserId};
use parley_core::error::{CapabilityError, DispatchError, Error, SettingError, StoreError};
use parley_core::event::{Event, EventKind, EventPayload};
use parley_core::storage::StorageBackend;
use parley_dispatch::{DispatchConfig, Dispatcher};
use parley_store::EntityStore;
use semver::{Version, VersionReq};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source name of events the runtime itself publishes.
pub const CORE_SOURCE: &str = "core";

/// Hex characters of the name digest used for storage directories.
const STORAGE_DIR_HASH_LEN: usize = 16;

/// Shared services. One per runtime.
pub struct CoreContext {
    pub store: Arc<EntityStore>,
    pub settings: Arc<SettingsRegistry>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub dispatcher: Dispatcher,

    /// Root for per-extension storage directories
    pub data_dir: PathBuf,

    /// Cancelled when the runtime begins shutting down
    pub shutdown: CancellationToken,

    pub started_at: DateTime<Utc>,
}

impl CoreContext {
    pub fn new(backend: Arc<dyn StorageBackend>, dispatch: DispatchConfig, data_dir: PathBuf) -> Self {
        let capabilities = Arc::new(CapabilityRegistry::new());
        Self {
            store: Arc::new(EntityStore::new(backend.clone())),
            settings: Arc::new(SettingsRegistry::new(backend)),
            dispatcher: Dispatcher::new(capabilities.clone(), dispatch),
            capabilities,
            data_dir,
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }
}

// ── Staging ─────────────────────────────────────────────────────────────────

/// A subscription requested during `load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedSubscription {
    pub kind: EventKind,
    pub trigger: String,
    pub priority: i32,
}

/// Everything an extension registered during `load`.
#[derive(Default)]
pub(crate) struct Staged {
    pub capabilities: Vec<CapabilityEntry>,
    pub subscriptions: Vec<StagedSubscription>,
    pub settings: Vec<(String, SettingSchema)>,
}

// ── Extension context ───────────────────────────────────────────────────────

/// An extension's view of the runtime.
pub struct ExtensionContext {
    name: String,
    version: Version,
    slot: LoadSlot,
    core: Arc<CoreContext>,
    staged: Mutex<Staged>,
    committed: AtomicBool,
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("slot", &self.slot)
            .finish()
    }
}

impl ExtensionContext {
    pub(crate) fn new(name: &str, version: Version, slot: LoadSlot, core: Arc<CoreContext>) -> Self {
        Self {
            name: name.to_string(),
            version,
            slot,
            core,
            staged: Mutex::new(Staged::default()),
            committed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Topological depth of this extension in the load order.
    pub fn generation(&self) -> usize {
        self.slot.generation
    }

    /// Place of this extension in the load pass.
    pub fn slot(&self) -> LoadSlot {
        self.slot
    }

    pub fn core(&self) -> &Arc<CoreContext> {
        &self.core
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.core.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    /// Cancelled when the runtime starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.core.shutdown.clone()
    }

    pub(crate) fn take_staged(&self) -> Staged {
        std::mem::take(&mut *self.staged.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn mark_committed(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }

    fn staging(&self) -> Result<std::sync::MutexGuard<'_, Staged>, Error> {
        if self.committed.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "extension '{}' can only register capabilities and subscriptions during load",
                self.name
            )));
        }
        Ok(self.staged.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // ── Registration ────────────────────────────────────────────────────────

    /// Stage a capability owned by this extension.
    pub fn register(&self, name: &str, version: Version, handler: Handler) -> parley_core::Result<()> {
        let mut staged = self.staging()?;
        let kind = handler.kind();
        if staged
            .capabilities
            .iter()
            .any(|e| e.kind() == kind && e.name == name && e.version == version)
        {
            return Err(CapabilityError::Duplicate {
                kind,
                name: name.to_string(),
                version,
                owner: self.name.clone(),
            }
            .into());
        }
        debug!(extension = %self.name, capability = %name, kind = %kind, "Staged capability");
        staged.capabilities.push(
            CapabilityEntry::new(name, version, &self.name, handler).slot(self.slot),
        );
        Ok(())
    }

    pub fn register_action(
        &self,
        name: &str,
        version: Version,
        action: Arc<dyn Action>,
    ) -> parley_core::Result<()> {
        self.register(name, version, Handler::Action(action))
    }

    pub fn register_trigger(
        &self,
        name: &str,
        version: Version,
        trigger: Arc<dyn Trigger>,
    ) -> parley_core::Result<()> {
        self.register(name, version, Handler::Trigger(trigger))
    }

    pub fn register_accessor(
        &self,
        name: &str,
        version: Version,
        accessor: Arc<dyn Accessor>,
    ) -> parley_core::Result<()> {
        self.register(name, version, Handler::Accessor(accessor))
    }

    /// Subscribe one of this extension's triggers to an event kind.
    ///
    /// The trigger must be registered by this extension during the same load;
    /// the highest registered version is used.
    pub fn subscribe(&self, kind: EventKind, trigger: &str, priority: i32) -> parley_core::Result<()> {
        let mut staged = self.staging()?;
        staged.subscriptions.push(StagedSubscription {
            kind,
            trigger: trigger.to_string(),
            priority,
        });
        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────────────

    /// Declare a setting in this extension's namespace.
    ///
    /// During load the declaration is committed together with the rest of
    /// the extension; afterwards it takes effect immediately.
    pub async fn declare_setting(&self, key: &str, schema: SettingSchema) -> Result<(), SettingError> {
        if !self.committed.load(Ordering::SeqCst) {
            if !schema.ty.accepts(&schema.default) {
                return Err(SettingError::TypeMismatch {
                    namespace: self.name.clone(),
                    key: key.to_string(),
                    expected: schema.ty,
                    found: parley_core::value::ValueType::describe(&schema.default).to_string(),
                });
            }
            self.staged
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .settings
                .push((key.to_string(), schema));
            return Ok(());
        }
        self.core.settings.declare(&self.name, key, schema).await
    }

    pub async fn setting(&self, key: &str) -> Result<Value, SettingError> {
        self.core.settings.get(&self.name, key).await
    }

    pub async fn set_setting(&self, key: &str, value: Value) -> Result<(), SettingError> {
        self.core.settings.set(&self.name, key, value).await
    }

    pub async fn watch_setting(&self, key: &str, watcher: Watcher) -> Result<WatchHandle, SettingError> {
        self.core.settings.watch(&self.name, key, watcher).await
    }

    // ── Capabilities of others ──────────────────────────────────────────────

    /// Look up a capability visible from this extension's place in the load pass.
    pub async fn lookup(
        &self,
        name: &str,
        requirement: &VersionReq,
        kind: CapabilityKind,
    ) -> Result<CapabilityEntry, CapabilityError> {
        self.core
            .capabilities
            .lookup_visible(name, requirement, kind, self.slot)
            .await
    }

    /// Invoke an action directly. Follow-up events are published.
    pub async fn invoke(
        &self,
        name: &str,
        requirement: &VersionReq,
        arguments: Arguments,
    ) -> Result<ActionOutcome, CapabilityError> {
        let entry = self.lookup(name, requirement, CapabilityKind::Action).await?;
        let ctx = ActionContext {
            invoker: Some(self.name.clone()),
            event: None,
            cancel: self.core.shutdown.child_token(),
        };
        let mut outcome = CapabilityRegistry::invoke_entry(&entry, arguments, ctx).await?;
        for event in std::mem::take(&mut outcome.events) {
            if let Err(e) = self.core.dispatcher.publish(event) {
                warn!(extension = %self.name, capability = %name, error = %e, "Dropped follow-up event");
            }
        }
        Ok(outcome)
    }

    /// Query an accessor visible at this extension's generation.
    pub async fn read(
        &self,
        name: &str,
        requirement: &VersionReq,
        query: Value,
    ) -> Result<Value, CapabilityError> {
        let entry = self.lookup(name, requirement, CapabilityKind::Accessor).await?;
        match entry.handler {
            Handler::Accessor(accessor) => accessor.read(query).await,
            _ => Err(CapabilityError::NotFound {
                kind: CapabilityKind::Accessor,
                name: name.to_string(),
                requirement: requirement.clone(),
            }),
        }
    }

    // ── Events ──────────────────────────────────────────────────────────────

    /// An event sourced from this extension.
    pub fn event(&self, payload: EventPayload) -> Event {
        Event::new(&self.name, payload)
    }

    pub fn publish(&self, event: Event) -> Result<(), DispatchError> {
        self.core.dispatcher.publish(event)
    }

    /// Send text to a chat through its platform's `<platform>.send` action.
    pub async fn send(
        &self,
        chat: &ChatId,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> parley_core::Result<ActionOutcome> {
        let platform = self.core.store.chat(chat).await?.platform;
        let mut arguments = Arguments::new();
        arguments.insert("chat".into(), json!(chat.as_str()));
        arguments.insert("text".into(), json!(text));
        if let Some(reply_to) = reply_to {
            arguments.insert("reply_to".into(), json!(reply_to.as_str()));
        }
        let action = format!("{platform}.send");
        Ok(self.invoke(&action, &VersionReq::STAR, arguments).await?)
    }

    // ── Data ────────────────────────────────────────────────────────────────

    pub async fn user_data(&self, user: &UserId) -> Result<Option<Value>, StoreError> {
        self.core.store.user_data(user, &self.name).await
    }

    pub async fn set_user_data(&self, user: &UserId, data: Value) -> Result<(), StoreError> {
        self.core.store.set_user_data(user, &self.name, data).await
    }

    /// Read-modify-write of this extension's data on `user`, atomic per user.
    pub async fn update_user_data(
        &self,
        user: &UserId,
        change: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, StoreError> {
        self.core.store.update_user_data(user, &self.name, change).await
    }

    pub async fn chat_data(&self, chat: &ChatId) -> Result<Option<Value>, StoreError> {
        self.core.store.chat_data(chat, &self.name).await
    }

    pub async fn set_chat_data(&self, chat: &ChatId, data: Value) -> Result<(), StoreError> {
        self.core.store.set_chat_data(chat, &self.name, data).await
    }

    /// Read-modify-write of this extension's data on `chat`, atomic per chat.
    pub async fn update_chat_data(
        &self,
        chat: &ChatId,
        change: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, StoreError> {
        self.core.store.update_chat_data(chat, &self.name, change).await
    }

    /// This extension's private directory, created on first use.
    pub fn storage_dir(&self) -> std::io::Result<PathBuf> {
        let digest = hex::encode(Sha256::digest(self.name.as_bytes()));
        let dir = self
            .core
            .data_dir
            .join("extensions")
            .join(&digest[..STORAGE_DIR_HASH_LEN]);
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir)?;
            debug!(extension = %self.name, path = %dir.display(), "Created storage directory");
        }
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::value::ValueType;
    use parley_store::InMemoryBackend;

    struct Noop;

    #[async_trait]
    impl Action for Noop {
        async fn invoke(
            &self,
            _arguments: Arguments,
            _ctx: ActionContext,
        ) -> Result<ActionOutcome, CapabilityError> {
            Ok(ActionOutcome::done())
        }
    }

    fn core(data_dir: PathBuf) -> Arc<CoreContext> {
        Arc::new(CoreContext::new(
            Arc::new(InMemoryBackend::new()),
            DispatchConfig::default(),
            data_dir,
        ))
    }

    #[test]
    fn duplicate_staging_is_rejected() {
        let ctx = ExtensionContext::new("greeter", Version::new(1, 0, 0), LoadSlot::default(), core(PathBuf::new()));
        ctx.register_action("greeter.hello", Version::new(1, 0, 0), Arc::new(Noop))
            .unwrap();
        let err = ctx
            .register_action("greeter.hello", Version::new(1, 0, 0), Arc::new(Noop))
            .unwrap_err();
        assert!(matches!(err, Error::Capability(CapabilityError::Duplicate { .. })));

        let staged = ctx.take_staged();
        assert_eq!(staged.capabilities.len(), 1);
        assert_eq!(staged.capabilities[0].owner, "greeter");
    }

    #[test]
    fn registration_closes_after_commit() {
        let ctx = ExtensionContext::new("greeter", Version::new(1, 0, 0), LoadSlot::default(), core(PathBuf::new()));
        ctx.mark_committed();
        assert!(
            ctx.register_action("late", Version::new(1, 0, 0), Arc::new(Noop))
                .is_err()
        );
        assert!(ctx.subscribe(EventKind::Ready, "late", 0).is_err());
    }

    #[tokio::test]
    async fn staged_setting_type_is_checked_early() {
        let ctx = ExtensionContext::new("greeter", Version::new(1, 0, 0), LoadSlot::default(), core(PathBuf::new()));
        let err = ctx
            .declare_setting("threshold", SettingSchema::new(ValueType::Int, "five"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettingError::TypeMismatch { .. }));
        assert!(ctx.take_staged().settings.is_empty());
    }

    #[test]
    fn storage_dir_is_hashed_and_created() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExtensionContext::new("greeter", Version::new(1, 0, 0), LoadSlot::default(), core(tmp.path().into()));
        let dir = ctx.storage_dir().unwrap();

        assert!(dir.is_dir());
        assert!(dir.starts_with(tmp.path().join("extensions")));
        let leaf = dir.file_name().unwrap().to_str().unwrap();
        assert_eq!(leaf.len(), STORAGE_DIR_HASH_LEN);
        assert!(leaf.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ctx.storage_dir().unwrap(), dir);
    }
}
