//! User, Chat, and Message domain types.
//!
//! These are the canonical records owned by the entity store. Extensions only
//! ever hold IDs plus cloned projections, which may be stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Opaque, platform-independent user identifier.
    UserId
);
entity_id!(
    /// Opaque chat identifier.
    ChatId
);
entity_id!(
    /// Stable message identifier, assigned on record.
    MessageId
);

/// A (platform tag, platform-native ID) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlatformIdentity {
    pub platform: String,
    pub native_id: String,
}

impl PlatformIdentity {
    pub fn new(platform: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            native_id: native_id.into(),
        }
    }
}

impl std::fmt::Display for PlatformIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.native_id)
    }
}

/// One real-world identity, possibly linked to several platform accounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,

    /// Display name per platform tag
    #[serde(default)]
    pub display_names: BTreeMap<String, String>,

    /// Linked platform identities; each pair maps to exactly one user
    #[serde(default)]
    pub identities: BTreeSet<PlatformIdentity>,

    /// Extension data, keyed by owning extension namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,

    /// Set when this record was absorbed by an explicit merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<UserId>,
}

impl User {
    pub fn new(identity: PlatformIdentity) -> Self {
        let mut display_names = BTreeMap::new();
        display_names.insert(identity.platform.clone(), identity.native_id.clone());
        Self {
            id: UserId::new(),
            display_names,
            identities: BTreeSet::from([identity]),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            merged_into: None,
        }
    }

    /// Preferred human-readable name.
    pub fn name(&self) -> &str {
        self.display_names
            .values()
            .next()
            .map(String::as_str)
            .unwrap_or(self.id.as_str())
    }

    /// Whether any platform display name equals `name` (case-insensitive).
    pub fn answers_to(&self, name: &str) -> bool {
        self.display_names.values().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn is_linked(&self, platform: &str, native_id: &str) -> bool {
        self.identities
            .iter()
            .any(|i| i.platform == platform && i.native_id == native_id)
    }
}

/// A conversation context on one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,

    /// Owning platform tag
    pub platform: String,

    /// Platform-native channel identifier
    pub native_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub members: BTreeSet<UserId>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(platform: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            id: ChatId::new(),
            platform: platform.into(),
            native_id: native_id.into(),
            name: None,
            members: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// A structured piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    Mention { user: UserId },
    Attachment(Attachment),
}

/// An attachment in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Type of attachment
    pub kind: AttachmentKind,

    /// URL or file path
    pub url: String,

    /// Optional filename
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Document,
    Audio,
    Video,
    Other,
}

/// Raw content plus its structured segments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub raw: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<Segment>,
}

impl MessageContent {
    /// Plain text content with a single text segment.
    pub fn text(text: impl Into<String>) -> Self {
        let raw = text.into();
        Self {
            segments: vec![Segment::Text { text: raw.clone() }],
            raw,
        }
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Users mentioned in this content.
    pub fn mentions(&self) -> impl Iterator<Item = &UserId> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Mention { user } => Some(user),
            _ => None,
        })
    }
}

/// An immutable record of something said in a chat.
///
/// Only the entity store constructs these. Deletion sets `deleted_at` and
/// keeps the record so cached IDs stay resolvable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub chat: ChatId,
    pub timestamp: DateTime<Utc>,
    pub content: MessageContent,

    /// The message this one replies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.content.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_is_linked_to_its_identity() {
        let user = User::new(PlatformIdentity::new("irc", "alice"));
        assert!(user.is_linked("irc", "alice"));
        assert!(!user.is_linked("discord", "alice"));
        assert_eq!(user.name(), "alice");
        assert!(user.answers_to("ALICE"));
    }

    #[test]
    fn text_content_has_one_segment() {
        let content = MessageContent::text("hi there");
        assert_eq!(content.raw, "hi there");
        assert_eq!(content.segments.len(), 1);
    }

    #[test]
    fn mentions_are_extracted() {
        let bob = UserId::new();
        let content = MessageContent::text("hey").with_segment(Segment::Mention { user: bob.clone() });
        assert_eq!(content.mentions().collect::<Vec<_>>(), vec![&bob]);
    }

    #[test]
    fn segment_serialization_is_tagged() {
        let seg = Segment::Attachment(Attachment {
            kind: AttachmentKind::Image,
            url: "https://example.com/cat.png".into(),
            filename: None,
            mime_type: Some("image/png".into()),
        });
        let json = serde_json::to_string(&seg).unwrap();
        assert!(json.contains("\"type\":\"attachment\""));
        assert!(json.contains("image/png"));
    }
}
