//! Per-extension typed settings.
//!
//! Each extension owns a namespace. Keys are declared with a type and a
//! default before use; values persist through the [`StorageBackend`] under
//! `settings/<namespace>/<key>` and survive restarts. Every (namespace, key)
//! slot has its own lock, so writers to different keys never contend.

use parley_core::error::SettingError;
use parley_core::storage::{StorageBackend, StorageQuery};
use parley_core::value::ValueType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Declared type and default of one setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingSchema {
    #[serde(rename = "type")]
    pub ty: ValueType,

    pub default: Value,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl SettingSchema {
    pub fn new(ty: ValueType, default: impl Into<Value>) -> Self {
        Self {
            ty,
            default: default.into(),
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Schemas are compatible when type and default agree; descriptions may differ.
    fn compatible(&self, other: &SettingSchema) -> bool {
        self.ty == other.ty && self.default == other.default
    }

    fn signature(&self) -> String {
        format!("{} (default {})", self.ty, self.default)
    }
}

/// Read-only view of a declared setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingEntry {
    pub namespace: String,
    pub key: String,
    pub schema: SettingSchema,

    /// Explicitly set value, if any
    pub value: Option<Value>,
}

impl SettingEntry {
    /// The value `get` would return.
    pub fn effective(&self) -> &Value {
        self.value.as_ref().unwrap_or(&self.schema.default)
    }
}

/// Change callback: `(namespace, key, new effective value)`.
///
/// Runs synchronously inside `set`, before `set` returns.
pub type Watcher = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Token returned by [`SettingsRegistry::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

struct Slot {
    schema: SettingSchema,
    value: Option<Value>,
    watchers: Vec<(WatchHandle, Watcher)>,
}

type SlotKey = (String, String);

pub struct SettingsRegistry {
    backend: Arc<dyn StorageBackend>,
    slots: RwLock<BTreeMap<SlotKey, Arc<Mutex<Slot>>>>,
    next_watch: AtomicU64,
}

fn storage_key(namespace: &str, key: &str) -> String {
    format!("settings/{namespace}/{key}")
}

impl SettingsRegistry {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            slots: RwLock::new(BTreeMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }

    async fn slot(&self, namespace: &str, key: &str) -> Result<Arc<Mutex<Slot>>, SettingError> {
        self.slots
            .read()
            .await
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| SettingError::Undeclared {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    /// Declare a setting.
    ///
    /// Redeclaring with the same type and default is a no-op; anything else
    /// is a [`SettingError::SchemaConflict`]. A previously persisted value is
    /// restored if it still fits the declared type.
    pub async fn declare(
        &self,
        namespace: &str,
        key: &str,
        schema: SettingSchema,
    ) -> Result<(), SettingError> {
        if !schema.ty.accepts(&schema.default) {
            return Err(SettingError::TypeMismatch {
                namespace: namespace.to_string(),
                key: key.to_string(),
                expected: schema.ty,
                found: ValueType::describe(&schema.default).to_string(),
            });
        }

        if let Ok(existing) = self.slot(namespace, key).await {
            return Self::check_redeclaration(namespace, key, &existing.lock().await.schema, &schema);
        }

        let persisted = self.load_persisted(namespace, key, &schema).await?;

        let mut slots = self.slots.write().await;
        let slot_key = (namespace.to_string(), key.to_string());
        if let Some(existing) = slots.get(&slot_key) {
            // Lost a race with a concurrent declaration.
            return Self::check_redeclaration(namespace, key, &existing.lock().await.schema, &schema);
        }

        debug!(namespace, key, ty = %schema.ty, "Declared setting");
        slots.insert(
            slot_key,
            Arc::new(Mutex::new(Slot {
                schema,
                value: persisted,
                watchers: Vec::new(),
            })),
        );
        Ok(())
    }

    fn check_redeclaration(
        namespace: &str,
        key: &str,
        existing: &SettingSchema,
        requested: &SettingSchema,
    ) -> Result<(), SettingError> {
        if existing.compatible(requested) {
            Ok(())
        } else {
            Err(SettingError::SchemaConflict {
                namespace: namespace.to_string(),
                key: key.to_string(),
                existing: existing.signature(),
                requested: requested.signature(),
            })
        }
    }

    async fn load_persisted(
        &self,
        namespace: &str,
        key: &str,
        schema: &SettingSchema,
    ) -> Result<Option<Value>, SettingError> {
        let Some(bytes) = self.backend.read(&storage_key(namespace, key)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) if schema.ty.accepts(&value) => Ok(Some(value)),
            Ok(value) => {
                warn!(
                    namespace,
                    key,
                    expected = %schema.ty,
                    found = ValueType::describe(&value),
                    "Ignoring persisted setting of the wrong type"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(namespace, key, error = %e, "Ignoring unreadable persisted setting");
                Ok(None)
            }
        }
    }

    /// Current value, or the declared default when unset.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Value, SettingError> {
        let slot = self.slot(namespace, key).await?;
        let slot = slot.lock().await;
        Ok(slot.value.clone().unwrap_or_else(|| slot.schema.default.clone()))
    }

    /// Validate, persist, then notify watchers of (namespace, key).
    ///
    /// A rejected value leaves the current value untouched.
    pub async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), SettingError> {
        let slot = self.slot(namespace, key).await?;
        let mut slot = slot.lock().await;

        if !slot.schema.ty.accepts(&value) {
            return Err(SettingError::TypeMismatch {
                namespace: namespace.to_string(),
                key: key.to_string(),
                expected: slot.schema.ty,
                found: ValueType::describe(&value).to_string(),
            });
        }

        let bytes = serde_json::to_vec(&value).map_err(|e| {
            SettingError::Storage(parley_core::error::StoreError::Corrupt {
                key: storage_key(namespace, key),
                reason: e.to_string(),
            })
        })?;
        self.backend.write(&storage_key(namespace, key), &bytes).await?;

        info!(namespace, key, "Setting changed");
        slot.value = Some(value);
        Self::notify(&slot, namespace, key);
        Ok(())
    }

    /// Forget the explicit value so `get` returns the default again.
    pub async fn reset(&self, namespace: &str, key: &str) -> Result<(), SettingError> {
        let slot = self.slot(namespace, key).await?;
        let mut slot = slot.lock().await;
        self.backend.delete(&storage_key(namespace, key)).await?;
        if slot.value.take().is_some() {
            Self::notify(&slot, namespace, key);
        }
        Ok(())
    }

    fn notify(slot: &Slot, namespace: &str, key: &str) {
        let effective = slot.value.as_ref().unwrap_or(&slot.schema.default);
        for (_, watcher) in &slot.watchers {
            watcher(namespace, key, effective);
        }
    }

    /// Register a change callback for one declared key.
    pub async fn watch(
        &self,
        namespace: &str,
        key: &str,
        watcher: Watcher,
    ) -> Result<WatchHandle, SettingError> {
        let slot = self.slot(namespace, key).await?;
        let handle = WatchHandle(self.next_watch.fetch_add(1, Ordering::SeqCst));
        slot.lock().await.watchers.push((handle, watcher));
        Ok(handle)
    }

    /// Remove a watcher. Returns whether it was registered.
    pub async fn unwatch(&self, handle: WatchHandle) -> bool {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            let mut slot = slot.lock().await;
            let before = slot.watchers.len();
            slot.watchers.retain(|(h, _)| *h != handle);
            if slot.watchers.len() != before {
                return true;
            }
        }
        false
    }

    /// Drop every declaration in `namespace`, keeping persisted values for
    /// the next session. Returns the number of keys removed.
    pub async fn remove_namespace(&self, namespace: &str) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|(ns, _), _| ns != namespace);
        let removed = before - slots.len();
        if removed > 0 {
            debug!(namespace, removed, "Removed settings namespace");
        }
        removed
    }

    /// Declared settings of one namespace, ordered by key.
    pub async fn entries(&self, namespace: &str) -> Vec<SettingEntry> {
        let slots: Vec<_> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((ns, key), slot)| (ns.clone(), key.clone(), slot.clone()))
            .collect();

        let mut entries = Vec::with_capacity(slots.len());
        for (namespace, key, slot) in slots {
            let slot = slot.lock().await;
            entries.push(SettingEntry {
                namespace,
                key,
                schema: slot.schema.clone(),
                value: slot.value.clone(),
            });
        }
        entries
    }

    /// Namespaces with at least one declared key.
    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .read()
            .await
            .keys()
            .map(|(ns, _)| ns.clone())
            .collect();
        names.dedup();
        names
    }

    /// Persisted values of a namespace, including keys not declared this session.
    pub async fn persisted(&self, namespace: &str) -> Result<BTreeMap<String, Value>, SettingError> {
        let prefix = format!("settings/{namespace}/");
        let rows = self.backend.query(StorageQuery::prefix(&prefix)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(k, bytes)| {
                let key = k.strip_prefix(&prefix)?.to_string();
                serde_json::from_slice(&bytes).ok().map(|v| (key, v))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::InMemoryBackend;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn registry() -> SettingsRegistry {
        SettingsRegistry::new(Arc::new(InMemoryBackend::new()))
    }

    #[tokio::test]
    async fn get_returns_default_until_set() {
        let settings = registry();
        settings
            .declare("greeter", "threshold", SettingSchema::new(ValueType::Int, 5))
            .await
            .unwrap();
        assert_eq!(settings.get("greeter", "threshold").await.unwrap(), json!(5));

        settings.set("greeter", "threshold", json!(9)).await.unwrap();
        assert_eq!(settings.get("greeter", "threshold").await.unwrap(), json!(9));
    }

    #[tokio::test]
    async fn type_mismatch_keeps_previous_value() {
        let settings = registry();
        settings
            .declare("A", "threshold", SettingSchema::new(ValueType::Int, 5))
            .await
            .unwrap();

        let err = settings.set("A", "threshold", json!("oops")).await.unwrap_err();
        assert!(matches!(
            err,
            SettingError::TypeMismatch { expected: ValueType::Int, .. }
        ));
        assert_eq!(settings.get("A", "threshold").await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn redeclaration_is_idempotent_or_conflicts() {
        let settings = registry();
        let schema = SettingSchema::new(ValueType::String, "hi");
        settings.declare("greeter", "greeting", schema.clone()).await.unwrap();
        settings
            .declare("greeter", "greeting", schema.describe("different text is fine"))
            .await
            .unwrap();

        let err = settings
            .declare("greeter", "greeting", SettingSchema::new(ValueType::Int, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, SettingError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn default_must_match_declared_type() {
        let settings = registry();
        let err = settings
            .declare("x", "flag", SettingSchema::new(ValueType::Bool, "yes"))
            .await
            .unwrap_err();
        assert!(matches!(err, SettingError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn undeclared_keys_are_rejected() {
        let settings = registry();
        assert!(matches!(
            settings.get("x", "nope").await,
            Err(SettingError::Undeclared { .. })
        ));
        assert!(settings.set("x", "nope", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn watchers_run_before_set_returns() {
        let settings = registry();
        settings
            .declare("greeter", "threshold", SettingSchema::new(ValueType::Int, 5))
            .await
            .unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = settings
            .watch(
                "greeter",
                "threshold",
                Arc::new(move |ns: &str, key: &str, value: &Value| {
                    sink.lock().unwrap().push(format!("{ns}.{key}={value}"));
                }),
            )
            .await
            .unwrap();

        settings.set("greeter", "threshold", json!(7)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["greeter.threshold=7"]);

        // Rejected writes notify nobody.
        let _ = settings.set("greeter", "threshold", json!(false)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        settings.reset("greeter", "threshold").await.unwrap();
        assert_eq!(seen.lock().unwrap().last().unwrap(), "greeter.threshold=5");

        assert!(settings.unwatch(handle).await);
        settings.set("greeter", "threshold", json!(8)).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn values_persist_across_registries() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        {
            let settings = SettingsRegistry::new(backend.clone());
            settings
                .declare("greeter", "threshold", SettingSchema::new(ValueType::Int, 5))
                .await
                .unwrap();
            settings.set("greeter", "threshold", json!(12)).await.unwrap();
        }

        let settings = SettingsRegistry::new(backend);
        settings
            .declare("greeter", "threshold", SettingSchema::new(ValueType::Int, 5))
            .await
            .unwrap();
        assert_eq!(settings.get("greeter", "threshold").await.unwrap(), json!(12));
        assert_eq!(settings.persisted("greeter").await.unwrap()["threshold"], json!(12));
    }

    #[tokio::test]
    async fn namespaces_are_isolated_and_removable() {
        let settings = registry();
        settings.declare("a", "k", SettingSchema::new(ValueType::Int, 1)).await.unwrap();
        settings.declare("b", "k", SettingSchema::new(ValueType::Int, 2)).await.unwrap();
        settings.set("a", "k", json!(10)).await.unwrap();

        assert_eq!(settings.get("b", "k").await.unwrap(), json!(2));
        assert_eq!(settings.namespaces().await, vec!["a", "b"]);

        assert_eq!(settings.remove_namespace("a").await, 1);
        assert!(settings.get("a", "k").await.is_err());
        assert_eq!(settings.entries("b").await.len(), 1);
        assert_eq!(settings.entries("b").await[0].effective(), &json!(2));
    }
}
