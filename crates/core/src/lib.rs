//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley chat-bot runtime.
//! This crate has **no runtime machinery** of its own. It defines the entities
//! (users, chats, messages), the event model, and the capability contracts that
//! every other crate and every extension implements against.
//!
//! ## Design Philosophy
//!
//! Every seam an extension touches is defined here:
//! - Capabilities are a closed set of kinds (action, trigger, accessor), each
//!   with its own trait, indexed by name and version in [`CapabilityRegistry`]
//! - Persistence goes through [`StorageBackend`], so the database engine is
//!   swappable and mockable
//! - Errors are grouped per bounded context and carry the owning extension

pub mod capability;
pub mod entity;
pub mod error;
pub mod event;
pub mod storage;
pub mod value;

// Re-export key types at crate root for ergonomics
pub use capability::{
    Accessor, Action, ActionContext, ActionOutcome, ArgumentSchema, ArgumentSpec, Arguments,
    CapabilityEntry, CapabilityKind, CapabilityRegistry, CapabilitySummary, Handler, LoadSlot,
    Trigger, TriggerMatch,
};
pub use entity::{
    Attachment, AttachmentKind, Chat, ChatId, Message, MessageContent, MessageId,
    PlatformIdentity, Segment, User, UserId,
};
pub use error::{
    CapabilityError, DependencyError, DispatchError, Error, LoadError, Result, SettingError,
    StoreError,
};
pub use event::{Event, EventKind, EventPayload};
pub use storage::{StorageBackend, StorageQuery};
pub use value::ValueType;

pub use semver::{Version, VersionReq};
pub use tokio_util::sync::CancellationToken;
