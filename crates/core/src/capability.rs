//! Capabilities: named, versioned units of behavior published by extensions.
//!
//! There are exactly three kinds, each with its own trait:
//! - [`Action`]: invoked with bound arguments to produce an effect
//! - [`Trigger`]: inspects an event and optionally produces a [`TriggerMatch`]
//! - [`Accessor`]: answers read-only data queries
//!
//! The [`CapabilityRegistry`] indexes them by (kind, name, version). It is
//! append-only during normal operation; entries disappear only when their
//! owning extension is unloaded.

use async_trait::async_trait;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CapabilityError;
use crate::event::Event;
use crate::value::ValueType;

/// Bound action arguments.
pub type Arguments = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Action,
    Trigger,
    Accessor,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action => f.write_str("action"),
            Self::Trigger => f.write_str("trigger"),
            Self::Accessor => f.write_str("accessor"),
        }
    }
}

// ── Argument schemas ────────────────────────────────────────────────────────

/// One declared action argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: ValueType,

    #[serde(default)]
    pub required: bool,
}

/// The argument contract of an action.
///
/// A closed schema rejects arguments it does not declare; an open schema
/// only checks the declared ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSchema {
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,

    #[serde(default)]
    pub open: bool,
}

impl ArgumentSchema {
    /// A closed schema with no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts any arguments.
    pub fn open() -> Self {
        Self {
            arguments: Vec::new(),
            open: true,
        }
    }

    pub fn required(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.arguments.push(ArgumentSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.arguments.push(ArgumentSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    /// Check `arguments` against this schema.
    pub fn validate(&self, capability: &str, arguments: &Arguments) -> Result<(), CapabilityError> {
        let invalid = |constraint: String| CapabilityError::InvalidArguments {
            capability: capability.to_string(),
            constraint,
        };

        for spec in &self.arguments {
            match arguments.get(&spec.name) {
                None if spec.required => {
                    return Err(invalid(format!("missing required argument '{}'", spec.name)));
                }
                None => {}
                Some(value) if !spec.ty.accepts(value) => {
                    return Err(invalid(format!(
                        "argument '{}' must be {}, got {}",
                        spec.name,
                        spec.ty,
                        ValueType::describe(value)
                    )));
                }
                Some(_) => {}
            }
        }

        if !self.open {
            if let Some(unknown) = arguments
                .keys()
                .find(|k| !self.arguments.iter().any(|s| &s.name == *k))
            {
                return Err(invalid(format!("unexpected argument '{unknown}'")));
            }
        }

        Ok(())
    }
}

// ── Capability traits ───────────────────────────────────────────────────────

/// Everything an action gets besides its arguments.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    /// Extension whose trigger (or direct call) requested the invocation
    pub invoker: Option<String>,

    /// The event that caused the invocation, when dispatched
    pub event: Option<Arc<Event>>,

    /// Cooperative cancellation; actions may ignore it
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn direct(invoker: impl Into<String>) -> Self {
        Self {
            invoker: Some(invoker.into()),
            ..Self::default()
        }
    }
}

/// The result of an action.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Optional structured output for direct callers
    pub output: Option<Value>,

    /// Follow-up events the dispatcher publishes on the action's behalf
    pub events: Vec<Event>,
}

impl ActionOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            events: Vec::new(),
        }
    }

    pub fn emit(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }
}

#[async_trait]
pub trait Action: Send + Sync {
    /// The argument contract enforced before every invocation.
    fn schema(&self) -> ArgumentSchema {
        ArgumentSchema::open()
    }

    async fn invoke(
        &self,
        arguments: Arguments,
        ctx: ActionContext,
    ) -> Result<ActionOutcome, CapabilityError>;
}

/// A trigger's positive answer: which action to run, with what.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    pub action: String,
    pub requirement: VersionReq,
    pub arguments: Arguments,

    /// Stop delivery to lower-priority triggers
    pub consume: bool,
}

impl TriggerMatch {
    pub fn action(name: impl Into<String>) -> Self {
        Self {
            action: name.into(),
            requirement: VersionReq::STAR,
            arguments: Map::new(),
            consume: false,
        }
    }

    pub fn version(mut self, requirement: VersionReq) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn consume(mut self) -> Self {
        self.consume = true;
        self
    }
}

#[async_trait]
pub trait Trigger: Send + Sync {
    /// Inspect an event. `Ok(None)` means no match.
    async fn inspect(&self, event: &Event) -> Result<Option<TriggerMatch>, CapabilityError>;
}

#[async_trait]
pub trait Accessor: Send + Sync {
    async fn read(&self, query: Value) -> Result<Value, CapabilityError>;
}

/// A typed handler for one of the three capability kinds.
#[derive(Clone)]
pub enum Handler {
    Action(Arc<dyn Action>),
    Trigger(Arc<dyn Trigger>),
    Accessor(Arc<dyn Accessor>),
}

impl Handler {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Action(_) => CapabilityKind::Action,
            Self::Trigger(_) => CapabilityKind::Trigger,
            Self::Accessor(_) => CapabilityKind::Accessor,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{}", self.kind())
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// A registered capability.
#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub name: String,
    pub version: Version,
    pub owner: String,

    /// Where the owner sits in the load pass
    pub slot: LoadSlot,

    pub handler: Handler,
}

/// An extension's place in the load pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadSlot {
    /// Topological depth
    pub generation: usize,

    /// Index in the load order
    pub position: usize,
}

impl LoadSlot {
    pub fn new(generation: usize, position: usize) -> Self {
        Self { generation, position }
    }

    /// Whether an entry registered at `other` is visible from here while the
    /// load pass runs: it must have loaded earlier, in another generation.
    pub fn sees(&self, other: &LoadSlot) -> bool {
        other.position < self.position && other.generation != self.generation
    }
}

impl CapabilityEntry {
    pub fn new(
        name: impl Into<String>,
        version: Version,
        owner: impl Into<String>,
        handler: Handler,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            owner: owner.into(),
            slot: LoadSlot::default(),
            handler,
        }
    }

    pub fn slot(mut self, slot: LoadSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn kind(&self) -> CapabilityKind {
        self.handler.kind()
    }

    pub fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            name: self.name.clone(),
            version: self.version.clone(),
            kind: self.kind(),
            owner: self.owner.clone(),
        }
    }
}

/// Discovery view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub name: String,
    pub version: Version,
    pub kind: CapabilityKind,
    pub owner: String,
}

type Index = BTreeMap<(CapabilityKind, String), BTreeMap<Version, CapabilityEntry>>;

/// Process-wide index of capabilities.
///
/// During the load pass an extension only sees entries of extensions that
/// loaded before it in another generation (see [`LoadSlot::sees`]); once
/// [`complete_load_pass`](Self::complete_load_pass) runs, everything is
/// visible to everyone.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<Index>,
    load_pass_complete: AtomicBool,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Fails if (kind, name, version) already exists.
    pub async fn register(&self, entry: CapabilityEntry) -> Result<(), CapabilityError> {
        let mut entries = self.entries.write().await;
        let key = (entry.kind(), entry.name.clone());
        if let Some(existing) = entries.get(&key).and_then(|v| v.get(&entry.version)) {
            return Err(CapabilityError::Duplicate {
                kind: entry.kind(),
                name: entry.name.clone(),
                version: entry.version.clone(),
                owner: existing.owner.clone(),
            });
        }
        info!(
            capability = %entry.name,
            version = %entry.version,
            kind = %entry.kind(),
            owner = %entry.owner,
            "Registered capability"
        );
        entries
            .entry(key)
            .or_default()
            .insert(entry.version.clone(), entry);
        Ok(())
    }

    /// Highest version of `name` satisfying `requirement`.
    pub async fn lookup(
        &self,
        name: &str,
        requirement: &VersionReq,
        kind: CapabilityKind,
    ) -> Result<CapabilityEntry, CapabilityError> {
        self.find(name, requirement, kind, |_| true).await
    }

    /// Like [`lookup`](Self::lookup), restricted to what an extension at
    /// `viewer` may see while the load pass is still running.
    pub async fn lookup_visible(
        &self,
        name: &str,
        requirement: &VersionReq,
        kind: CapabilityKind,
        viewer: LoadSlot,
    ) -> Result<CapabilityEntry, CapabilityError> {
        if self.is_load_pass_complete() {
            return self.lookup(name, requirement, kind).await;
        }
        self.find(name, requirement, kind, |e| viewer.sees(&e.slot))
            .await
    }

    async fn find(
        &self,
        name: &str,
        requirement: &VersionReq,
        kind: CapabilityKind,
        visible: impl Fn(&CapabilityEntry) -> bool,
    ) -> Result<CapabilityEntry, CapabilityError> {
        let entries = self.entries.read().await;
        entries
            .get(&(kind, name.to_string()))
            .and_then(|versions| {
                versions
                    .values()
                    .rev()
                    .find(|e| requirement.matches(&e.version) && visible(e))
            })
            .cloned()
            .ok_or_else(|| CapabilityError::NotFound {
                kind,
                name: name.to_string(),
                requirement: requirement.clone(),
            })
    }

    /// Resolve, validate, and invoke an action.
    pub async fn invoke(
        &self,
        name: &str,
        requirement: &VersionReq,
        arguments: Arguments,
        ctx: ActionContext,
    ) -> Result<ActionOutcome, CapabilityError> {
        let entry = self.lookup(name, requirement, CapabilityKind::Action).await?;
        Self::invoke_entry(&entry, arguments, ctx).await
    }

    /// Validate and invoke an already-resolved action entry.
    pub async fn invoke_entry(
        entry: &CapabilityEntry,
        arguments: Arguments,
        ctx: ActionContext,
    ) -> Result<ActionOutcome, CapabilityError> {
        let Handler::Action(action) = &entry.handler else {
            return Err(CapabilityError::NotFound {
                kind: CapabilityKind::Action,
                name: entry.name.clone(),
                requirement: VersionReq::STAR,
            });
        };
        action.schema().validate(&entry.name, &arguments)?;
        if ctx.cancel.is_cancelled() {
            return Err(CapabilityError::Cancelled {
                capability: entry.name.clone(),
            });
        }
        action.invoke(arguments, ctx).await
    }

    /// Query an accessor.
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

    /// All registered capabilities of one kind, ordered by name then version.
    pub async fn list(&self, kind: CapabilityKind) -> Vec<CapabilitySummary> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .flat_map(|(_, versions)| versions.values().map(CapabilityEntry::summary))
            .collect()
    }

    /// Every capability published by `owner`.
    pub async fn owned_by(&self, owner: &str) -> Vec<CapabilitySummary> {
        let entries = self.entries.read().await;
        entries
            .values()
            .flat_map(|versions| versions.values())
            .filter(|e| e.owner == owner)
            .map(CapabilityEntry::summary)
            .collect()
    }

    /// Remove everything `owner` registered. Returns the number removed.
    pub async fn unregister_owner(&self, owner: &str) -> usize {
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for versions in entries.values_mut() {
            let before = versions.len();
            versions.retain(|_, e| e.owner != owner);
            removed += before - versions.len();
        }
        entries.retain(|_, versions| !versions.is_empty());
        debug!(owner, removed, "Unregistered capabilities");
        removed
    }

    /// Make every entry visible to every extension.
    pub fn complete_load_pass(&self) {
        self.load_pass_complete.store(true, Ordering::SeqCst);
    }

    pub fn is_load_pass_complete(&self) -> bool {
        self.load_pass_complete.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
