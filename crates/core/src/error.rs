//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; every variant that can be
//! caused by an extension names that extension so failures stay attributable.

use semver::{Version, VersionReq};
use thiserror::Error;

use crate::capability::CapabilityKind;
use crate::value::ValueType;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Extension graph errors ---
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    // --- Extension load errors ---
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    // --- Capability errors ---
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    // --- Dispatcher errors ---
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    // --- Entity store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Settings registry errors ---
    #[error("Setting error: {0}")]
    Setting(#[from] SettingError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Unsatisfiable or cyclic extension dependencies.
///
/// Fatal to the dependent subtree, never to the whole process.
#[derive(Debug, Clone, Error)]
pub enum DependencyError {
    #[error("Extension '{extension}' requires '{dependency}' ({requirement}), which is not installed")]
    Missing {
        extension: String,
        dependency: String,
        requirement: VersionReq,
    },

    #[error("Extension '{extension}' requires '{dependency}' {requirement}, but version {found} is installed")]
    VersionMismatch {
        extension: String,
        dependency: String,
        requirement: VersionReq,
        found: Version,
    },

    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<String>> },

    #[error("'{name}' is provided by more than one extension: {}", .providers.join(", "))]
    DuplicateProvider { name: String, providers: Vec<String> },

    #[error("Extension '{extension}' skipped because its dependency '{ancestor}' failed to load")]
    FailedAncestor { extension: String, ancestor: String },

    #[error("Extension '{extension}' is still required by: {}", .dependents.join(", "))]
    HasDependents {
        extension: String,
        dependents: Vec<String>,
    },
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| format!("[{}]", c.join(" -> ")))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DependencyError {
    /// The extension this error is attributed to, if it concerns a single one.
    pub fn extension(&self) -> Option<&str> {
        match self {
            Self::Missing { extension, .. }
            | Self::VersionMismatch { extension, .. }
            | Self::FailedAncestor { extension, .. }
            | Self::HasDependents { extension, .. } => Some(extension),
            Self::Cycle { .. } | Self::DuplicateProvider { .. } => None,
        }
    }

    /// Every extension name the error implicates.
    pub fn implicated(&self) -> Vec<String> {
        match self {
            Self::Cycle { cycles } => cycles.iter().flatten().cloned().collect(),
            Self::DuplicateProvider { providers, .. } => providers.clone(),
            other => other.extension().map(|e| vec![e.to_string()]).unwrap_or_default(),
        }
    }
}

/// An extension failed while being instantiated or started.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("Invalid manifest at {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("Extension '{extension}' names unknown entry point '{entry_point}'")]
    UnknownEntryPoint {
        extension: String,
        entry_point: String,
    },

    #[error("Extension '{extension}' entry point failed: {reason}")]
    EntryPointFailed { extension: String, reason: String },

    #[error("Extension '{extension}' entry point panicked")]
    EntryPointPanicked { extension: String },

    #[error("Extension '{extension}' registered undeclared {kind} '{name}' {version}")]
    UndeclaredCapability {
        extension: String,
        kind: CapabilityKind,
        name: String,
        version: Version,
    },

    #[error("Extension '{extension}' declared {kind} '{name}' {version} but never registered it")]
    MissingCapability {
        extension: String,
        kind: CapabilityKind,
        name: String,
        version: Version,
    },

    #[error("Extension '{extension}' capability rejected: {source}")]
    Capability {
        extension: String,
        #[source]
        source: CapabilityError,
    },

    #[error("Extension '{extension}' config schema rejected: {source}")]
    Setting {
        extension: String,
        #[source]
        source: SettingError,
    },

    #[error("Extension '{extension}' failed to start: {reason}")]
    StartFailed { extension: String, reason: String },

    #[error("Extension '{extension}' is already loaded")]
    AlreadyLoaded { extension: String },

    #[error("Extension '{extension}' is not loaded")]
    NotLoaded { extension: String },
}

impl LoadError {
    /// The extension this error is attributed to.
    pub fn extension(&self) -> Option<&str> {
        match self {
            Self::Manifest { .. } => None,
            Self::UnknownEntryPoint { extension, .. }
            | Self::EntryPointFailed { extension, .. }
            | Self::EntryPointPanicked { extension }
            | Self::UndeclaredCapability { extension, .. }
            | Self::MissingCapability { extension, .. }
            | Self::Capability { extension, .. }
            | Self::Setting { extension, .. }
            | Self::StartFailed { extension, .. }
            | Self::AlreadyLoaded { extension }
            | Self::NotLoaded { extension } => Some(extension),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("{kind} '{name}' {version} is already registered by '{owner}'")]
    Duplicate {
        kind: CapabilityKind,
        name: String,
        version: Version,
        owner: String,
    },

    #[error("No {kind} '{name}' matching {requirement}")]
    NotFound {
        kind: CapabilityKind,
        name: String,
        requirement: VersionReq,
    },

    /// The action invocation error: arguments violate the action's schema.
    #[error("Invalid invocation of '{capability}': {constraint}")]
    InvalidArguments {
        capability: String,
        constraint: String,
    },

    #[error("Capability '{capability}' failed: {reason}")]
    HandlerFailed { capability: String, reason: String },

    #[error("Capability '{capability}' panicked")]
    Panicked { capability: String },

    #[error("Capability '{capability}' timed out after {timeout_ms}ms")]
    Timeout { capability: String, timeout_ms: u64 },

    #[error("Capability '{capability}' was cancelled")]
    Cancelled { capability: String },
}

impl CapabilityError {
    /// Short machine-readable name of the error kind, used in failure reports.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "duplicate",
            Self::NotFound { .. } => "not_found",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::Panicked { .. } => "panicked",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Shorthand for handler implementations reporting a failure.
    pub fn failed(capability: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::HandlerFailed {
            capability: capability.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Dispatcher is shutting down; event rejected")]
    ShuttingDown,

    #[error("Unknown subscription handle: {0}")]
    UnknownSubscription(u64),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Identity {platform}:{native_id} is already linked to user {linked_to}, not {requested}")]
    IdentityConflict {
        platform: String,
        native_id: String,
        linked_to: String,
        requested: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum SettingError {
    #[error("Setting {namespace}.{key} already declared as {existing}, not {requested}")]
    SchemaConflict {
        namespace: String,
        key: String,
        existing: String,
        requested: String,
    },

    #[error("Setting {namespace}.{key} expects {expected}, got {found}")]
    TypeMismatch {
        namespace: String,
        key: String,
        expected: ValueType,
        found: String,
    },

    #[error("Setting {namespace}.{key} is not declared")]
    Undeclared { namespace: String, key: String },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_lists_every_member() {
        let err = DependencyError::Cycle {
            cycles: vec![vec!["a".into(), "b".into()], vec!["x".into()]],
        };
        let text = err.to_string();
        assert!(text.contains("[a -> b]"));
        assert!(text.contains("[x]"));
        assert_eq!(err.implicated(), vec!["a", "b", "x"]);
    }

    #[test]
    fn load_error_is_attributed() {
        let err = LoadError::Capability {
            extension: "greeter".into(),
            source: CapabilityError::Duplicate {
                kind: CapabilityKind::Action,
                name: "say".into(),
                version: Version::new(1, 0, 0),
                owner: "console".into(),
            },
        };
        assert_eq!(err.extension(), Some("greeter"));
        let text = err.to_string();
        assert!(text.contains("greeter"));
        assert!(text.contains("console"));
    }

    #[test]
    fn invalid_arguments_names_capability_and_constraint() {
        let err = Error::Capability(CapabilityError::InvalidArguments {
            capability: "console.send".into(),
            constraint: "missing required argument 'text'".into(),
        });
        assert!(err.to_string().contains("console.send"));
        assert!(err.to_string().contains("'text'"));
    }
}
