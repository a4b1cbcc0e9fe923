//! The entity store: canonical users, chats, and messages.
//!
//! Records are JSON documents under path-like keys:
//!
//! | key                                   | value                     |
//! |---------------------------------------|---------------------------|
//! | `user/<id>`                           | [`User`]                  |
//! | `identity/<platform>/<native>`        | owning user ID            |
//! | `chat/<id>`                           | [`Chat`]                  |
//! | `chat_key/<platform>/<native>`        | chat ID                   |
//! | `message/<chat>/<micros>-<seq>`       | [`Message`]               |
//! | `message_id/<id>`                     | `message/...` key         |
//!
//! Platform components are hex-encoded so any native ID is a safe key
//! segment. Conflicting writes to one entity serialize on that entity's key
//! through [`KeyedLocks`]; the store never holds a global lock.

use chrono::Utc;
use parley_core::entity::{
    Chat, ChatId, Message, MessageContent, MessageId, PlatformIdentity, User, UserId,
};
use parley_core::error::StoreError;
use parley_core::storage::{StorageBackend, StorageQuery};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::locks::KeyedLocks;

/// Platform tag of the bot's own identity.
pub const SELF_PLATFORM: &str = "core";
/// Native ID of the bot's own identity.
pub const SELF_NATIVE_ID: &str = "self";

/// Options for reading a chat's history.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Most recent N messages; `None` returns the whole history
    pub limit: Option<usize>,

    /// Include tombstoned messages
    pub include_deleted: bool,
}

impl MessageQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            include_deleted: false,
        }
    }
}

fn user_key(id: &UserId) -> String {
    format!("user/{id}")
}

fn identity_key(platform: &str, native_id: &str) -> String {
    format!("identity/{}/{}", hex::encode(platform), hex::encode(native_id))
}

fn chat_key(id: &ChatId) -> String {
    format!("chat/{id}")
}

fn chat_native_key(platform: &str, native_id: &str) -> String {
    format!("chat_key/{}/{}", hex::encode(platform), hex::encode(native_id))
}

fn message_prefix(chat: &ChatId) -> String {
    format!("message/{chat}/")
}

fn message_index_key(id: &MessageId) -> String {
    format!("message_id/{id}")
}

/// Canonical owner of User, Chat, and Message records.
pub struct EntityStore {
    backend: Arc<dyn StorageBackend>,
    locks: KeyedLocks,
    sequence: AtomicU64,
}

impl EntityStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            locks: KeyedLocks::new(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ── Record helpers ──────────────────────────────────────────────────────

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.read(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.backend.write(key, &bytes).await
    }

    async fn scan<T: DeserializeOwned>(&self, query: StorageQuery) -> Result<Vec<T>, StoreError> {
        self.backend
            .query(query)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    // ── Users ───────────────────────────────────────────────────────────────

    /// The user linked to (platform, native_id), created on first sight.
    pub async fn get_or_create_user(&self, platform: &str, native_id: &str) -> Result<User, StoreError> {
        let index = identity_key(platform, native_id);
        let _guard = self.locks.lock(&index).await;

        if let Some(id) = self.load::<UserId>(&index).await? {
            return self.user(&id).await;
        }

        let user = User::new(PlatformIdentity::new(platform, native_id));
        // Record first so the index never points at a missing user.
        self.save(&user_key(&user.id), &user).await?;
        self.save(&index, &user.id).await?;
        info!(user = %user.id, platform, native_id, "Created user");
        Ok(user)
    }

    /// The bot's own user.
    pub async fn self_user(&self) -> Result<User, StoreError> {
        self.get_or_create_user(SELF_PLATFORM, SELF_NATIVE_ID).await
    }

    pub async fn get_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        self.load(&user_key(id)).await
    }

    /// Like [`get_user`](Self::get_user) but missing users are an error.
    pub async fn user(&self, id: &UserId) -> Result<User, StoreError> {
        self.get_user(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "user",
            id: id.to_string(),
        })
    }

    pub async fn find_user_by_identity(
        &self,
        platform: &str,
        native_id: &str,
    ) -> Result<Option<User>, StoreError> {
        match self.load::<UserId>(&identity_key(platform, native_id)).await? {
            Some(id) => self.get_user(&id).await,
            None => Ok(None),
        }
    }

    /// Live users with a display name equal to `name` (case-insensitive).
    pub async fn find_users_by_name(&self, name: &str) -> Result<Vec<User>, StoreError> {
        Ok(self
            .list_users()
            .await?
            .into_iter()
            .filter(|u| u.answers_to(name))
            .collect())
    }

    /// All users that have not been merged into another.
    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let users: Vec<User> = self.scan(StorageQuery::prefix("user/")).await?;
        Ok(users.into_iter().filter(|u| u.merged_into.is_none()).collect())
    }

    /// Link another platform identity to `user`.
    ///
    /// Idempotent when the pair already belongs to `user`; fails with
    /// [`StoreError::IdentityConflict`] when it belongs to someone else.
    pub async fn link_identity(
        &self,
        user: &UserId,
        platform: &str,
        native_id: &str,
    ) -> Result<User, StoreError> {
        let index = identity_key(platform, native_id);
        let _identity_guard = self.locks.lock(&index).await;

        match self.load::<UserId>(&index).await? {
            Some(existing) if &existing == user => return self.user(user).await,
            Some(existing) => {
                return Err(StoreError::IdentityConflict {
                    platform: platform.to_string(),
                    native_id: native_id.to_string(),
                    linked_to: existing.to_string(),
                    requested: user.to_string(),
                });
            }
            None => {}
        }

        let key = user_key(user);
        let _user_guard = self.locks.lock(&key).await;
        let mut record = self.user(user).await?;
        record.identities.insert(PlatformIdentity::new(platform, native_id));
        record
            .display_names
            .entry(platform.to_string())
            .or_insert_with(|| native_id.to_string());
        self.save(&key, &record).await?;
        self.save(&index, user).await?;
        info!(user = %user, platform, native_id, "Linked identity");
        Ok(record)
    }

    /// Explicitly merge `absorb` into `keep`.
    ///
    /// Identities, display names, and extension data move to `keep` (existing
    /// values on `keep` win). The absorbed record stays, marked `merged_into`,
    /// so cached IDs still resolve.
    pub async fn merge_users(&self, keep: &UserId, absorb: &UserId) -> Result<User, StoreError> {
        if keep == absorb {
            return self.user(keep).await;
        }
        let keep_key = user_key(keep);
        let absorb_key = user_key(absorb);

        loop {
            let snapshot = self.user(absorb).await?;
            let identity_keys: BTreeSet<String> = snapshot
                .identities
                .iter()
                .map(|i| identity_key(&i.platform, &i.native_id))
                .collect();

            // Identity locks before user locks, matching link_identity.
            let _identity_guards = self.locks.lock_all(&identity_keys).await;
            let _user_guards = self.locks.lock_all([&keep_key, &absorb_key]).await;

            let mut absorbed = self.user(absorb).await?;
            let current: BTreeSet<String> = absorbed
                .identities
                .iter()
                .map(|i| identity_key(&i.platform, &i.native_id))
                .collect();
            if current != identity_keys {
                // An identity was linked meanwhile; retry with the new set.
                continue;
            }

            let mut kept = self.user(keep).await?;
            for identity in std::mem::take(&mut absorbed.identities) {
                self.save(&identity_key(&identity.platform, &identity.native_id), keep)
                    .await?;
                kept.identities.insert(identity);
            }
            for (platform, name) in std::mem::take(&mut absorbed.display_names) {
                kept.display_names.entry(platform).or_insert(name);
            }
            for (namespace, data) in std::mem::take(&mut absorbed.metadata) {
                kept.metadata.entry(namespace).or_insert(data);
            }
            absorbed.merged_into = Some(keep.clone());

            self.save(&keep_key, &kept).await?;
            self.save(&absorb_key, &absorbed).await?;
            info!(keep = %keep, absorb = %absorb, "Merged users");
            return Ok(kept);
        }
    }

    pub async fn set_display_name(
        &self,
        user: &UserId,
        platform: &str,
        name: &str,
    ) -> Result<User, StoreError> {
        self.update_user(user, |u| {
            u.display_names.insert(platform.to_string(), name.to_string());
        })
        .await
    }

    /// Extension data stored on a user under `namespace`.
    pub async fn user_data(&self, user: &UserId, namespace: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.user(user).await?.metadata.get(namespace).cloned())
    }

    pub async fn set_user_data(
        &self,
        user: &UserId,
        namespace: &str,
        data: Value,
    ) -> Result<(), StoreError> {
        self.update_user(user, |u| {
            u.metadata.insert(namespace.to_string(), data);
        })
        .await
        .map(|_| ())
    }

    /// Replace the user's data under `namespace` with `change(current)`.
    /// Concurrent updates of one user are applied one after another.
    pub async fn update_user_data(
        &self,
        user: &UserId,
        namespace: &str,
        change: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, StoreError> {
        let mut updated = Value::Null;
        self.update_user(user, |u| {
            updated = change(u.metadata.remove(namespace));
            u.metadata.insert(namespace.to_string(), updated.clone());
        })
        .await?;
        Ok(updated)
    }

    async fn update_user(
        &self,
        user: &UserId,
        change: impl FnOnce(&mut User),
    ) -> Result<User, StoreError> {
        let key = user_key(user);
        let _guard = self.locks.lock(&key).await;
        let mut record = self.user(user).await?;
        change(&mut record);
        self.save(&key, &record).await?;
        Ok(record)
    }

    // ── Chats ───────────────────────────────────────────────────────────────

    /// The chat identified by (platform, native_id), created on first sight.
    pub async fn get_or_create_chat(&self, platform: &str, native_id: &str) -> Result<Chat, StoreError> {
        let index = chat_native_key(platform, native_id);
        let _guard = self.locks.lock(&index).await;

        if let Some(id) = self.load::<ChatId>(&index).await? {
            return self.chat(&id).await;
        }

        let chat = Chat::new(platform, native_id);
        self.save(&chat_key(&chat.id), &chat).await?;
        self.save(&index, &chat.id).await?;
        info!(chat = %chat.id, platform, native_id, "Created chat");
        Ok(chat)
    }

    pub async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, StoreError> {
        self.load(&chat_key(id)).await
    }

    pub async fn chat(&self, id: &ChatId) -> Result<Chat, StoreError> {
        self.get_chat(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "chat",
            id: id.to_string(),
        })
    }

    pub async fn find_chat(&self, platform: &str, native_id: &str) -> Result<Option<Chat>, StoreError> {
        match self.load::<ChatId>(&chat_native_key(platform, native_id)).await? {
            Some(id) => self.get_chat(&id).await,
            None => Ok(None),
        }
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>, StoreError> {
        self.scan(StorageQuery::prefix("chat/")).await
    }

    /// Add `user` to the chat. Returns whether membership changed.
    pub async fn add_member(&self, chat: &ChatId, user: &UserId) -> Result<bool, StoreError> {
        let mut added = false;
        self.update_chat(chat, |c| added = c.members.insert(user.clone()))
            .await?;
        Ok(added)
    }

    /// Remove `user` from the chat. Returns whether membership changed.
    pub async fn remove_member(&self, chat: &ChatId, user: &UserId) -> Result<bool, StoreError> {
        let mut removed = false;
        self.update_chat(chat, |c| removed = c.members.remove(user)).await?;
        Ok(removed)
    }

    pub async fn set_chat_name(&self, chat: &ChatId, name: &str) -> Result<Chat, StoreError> {
        self.update_chat(chat, |c| c.name = Some(name.to_string())).await
    }

    pub async fn chat_data(&self, chat: &ChatId, namespace: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.chat(chat).await?.metadata.get(namespace).cloned())
    }

    pub async fn set_chat_data(
        &self,
        chat: &ChatId,
        namespace: &str,
        data: Value,
    ) -> Result<(), StoreError> {
        self.update_chat(chat, |c| {
            c.metadata.insert(namespace.to_string(), data);
        })
        .await
        .map(|_| ())
    }

    /// Replace the chat's data under `namespace` with `change(current)`.
    /// Concurrent updates of one chat are applied one after another.
    pub async fn update_chat_data(
        &self,
        chat: &ChatId,
        namespace: &str,
        change: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value, StoreError> {
        let mut updated = Value::Null;
        self.update_chat(chat, |c| {
            updated = change(c.metadata.remove(namespace));
            c.metadata.insert(namespace.to_string(), updated.clone());
        })
        .await?;
        Ok(updated)
    }

    async fn update_chat(
        &self,
        chat: &ChatId,
        change: impl FnOnce(&mut Chat),
    ) -> Result<Chat, StoreError> {
        let key = chat_key(chat);
        let _guard = self.locks.lock(&key).await;
        let mut record = self.chat(chat).await?;
        change(&mut record);
        self.save(&key, &record).await?;
        Ok(record)
    }

    // ── Messages ────────────────────────────────────────────────────────────

    /// Record a new message. Fails only when storage is unavailable; the
    /// caller owns buffering and retry.
    pub async fn record_message(
        &self,
        sender: &UserId,
        chat: &ChatId,
        content: MessageContent,
    ) -> Result<Message, StoreError> {
        self.insert_message(sender, chat, content, None).await
    }

    /// Record a message replying to `reply_to`.
    pub async fn record_reply(
        &self,
        sender: &UserId,
        chat: &ChatId,
        content: MessageContent,
        reply_to: &MessageId,
    ) -> Result<Message, StoreError> {
        self.insert_message(sender, chat, content, Some(reply_to.clone()))
            .await
    }

    async fn insert_message(
        &self,
        sender: &UserId,
        chat: &ChatId,
        content: MessageContent,
        reply_to: Option<MessageId>,
    ) -> Result<Message, StoreError> {
        let timestamp = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = format!(
            "{}{:020}-{:012}",
            message_prefix(chat),
            timestamp.timestamp_micros().max(0),
            seq
        );
        let message = Message {
            id: MessageId::new(),
            sender: sender.clone(),
            chat: chat.clone(),
            timestamp,
            content,
            reply_to,
            deleted_at: None,
        };

        self.save(&key, &message).await?;
        self.save(&message_index_key(&message.id), &key).await?;
        debug!(message = %message.id, chat = %chat, "Recorded message");
        Ok(message)
    }

    pub async fn get_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        match self.load::<String>(&message_index_key(id)).await? {
            Some(key) => self.load(&key).await,
            None => Ok(None),
        }
    }

    /// A chat's messages, oldest first.
    pub async fn messages_in_chat(
        &self,
        chat: &ChatId,
        query: MessageQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let mut scan = StorageQuery::prefix(message_prefix(chat));
        if query.include_deleted {
            if let Some(limit) = query.limit {
                scan = scan.limit(limit).tail();
            }
        }

        let mut messages: Vec<Message> = self.scan(scan).await?;
        if !query.include_deleted {
            messages.retain(|m| !m.is_deleted());
            if let Some(limit) = query.limit {
                let skip = messages.len().saturating_sub(limit);
                messages.drain(..skip);
            }
        }
        Ok(messages)
    }

    /// Tombstone a message. The record is kept; repeated deletes are no-ops.
    pub async fn delete_message(&self, id: &MessageId) -> Result<Message, StoreError> {
        let index = message_index_key(id);
        let _guard = self.locks.lock(&index).await;

        let not_found = || StoreError::NotFound {
            entity: "message",
            id: id.to_string(),
        };
        let key = self.load::<String>(&index).await?.ok_or_else(not_found)?;
        let mut message: Message = self.load(&key).await?.ok_or_else(not_found)?;
        if message.deleted_at.is_none() {
            message.deleted_at = Some(Utc::now());
            self.save(&key, &message).await?;
            info!(message = %id, "Tombstoned message");
        }
        Ok(message)
    }
}
