// Copyright 2024 The Quill Project Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{EventError, GroupError, GroupResult},
    events::{
        DecryptedEvent, EncryptedEvent, EncryptedEventContent, EncryptionInfo, GroupMessagePayload,
        RoomKeyContent,
    },
    ratchet::{
        Account, EncryptionSettings, ExportedRoomKey, InboundGroupSession, OutboundGroupSession,
    },
    store::Store,
    types::{EventEncryptionAlgorithm, EventId, RoomId},
};

/// The result of an import of room keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyImportResult {
    /// The number of sessions that were stored or updated.
    pub imported_count: usize,
    /// The number of sessions the import contained.
    pub total_count: usize,
}

/// Owns the group session lifecycle: outbound sessions per room, inbound
/// session creation and decryption, the per-timeline replay guard, and the
/// export/import of room key bundles.
#[derive(Debug, Clone)]
pub(crate) struct GroupSessionManager {
    account: Account,
    /// Store for the encryption keys. Persists all the sessions so a client
    /// can resume without creating new keys.
    store: Store,
    /// The currently active outbound group sessions.
    outbound_group_sessions: Arc<DashMap<RoomId, OutboundGroupSession>>,
    /// Per timeline, the event id that first consumed each
    /// `sender_key|session_id|message_index` triple.
    replay_guard: Arc<DashMap<String, HashMap<String, EventId>>>,
}

impl GroupSessionManager {
    pub(crate) fn new(account: Account, store: Store) -> Self {
        Self {
            account,
            store,
            outbound_group_sessions: Arc::new(DashMap::new()),
            replay_guard: Arc::new(DashMap::new()),
        }
    }

    /// Get the outbound group session for a room, if one exists.
    pub fn get_outbound_group_session(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.outbound_group_sessions.get(room_id).map(|s| s.clone())
    }

    /// Should a new group session be created and shared before room messages
    /// can be encrypted.
    ///
    /// This should be checked before every message since sessions expire on
    /// their own.
    pub fn should_share_group_session(&self, room_id: &RoomId) -> bool {
        match self.outbound_group_sessions.get(room_id) {
            Some(s) => !s.shared() || s.expired(),
            None => true,
        }
    }

    /// Drop the outbound group session of a room, forcing a new one to be
    /// created and shared on the next encryption.
    pub fn invalidate_group_session(&self, room_id: &RoomId) -> bool {
        self.outbound_group_sessions.remove(room_id).is_some()
    }

    /// Create a new outbound group session for the room.
    ///
    /// The matching inbound session is persisted so our own messages stay
    /// decryptable.
    pub async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> GroupResult<OutboundGroupSession> {
        let (outbound, inbound) = self.account.create_group_session_pair(room_id, settings).await?;

        self.store.save_inbound_group_session(inbound).await?;
        self.outbound_group_sessions.insert(room_id.clone(), outbound.clone());

        Ok(outbound)
    }

    /// Encrypt an event for the room using the shared outbound group
    /// session.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> GroupResult<EncryptedEventContent> {
        let session = self
            .get_outbound_group_session(room_id)
            .filter(|s| s.shared() && !s.expired())
            .ok_or_else(|| GroupError::MissingOutboundSession(room_id.clone()))?;

        session.encrypt(event_type, content).await
    }

    /// Create an inbound group session from a received room key and persist
    /// it.
    ///
    /// Returns `None` if the key used an unsupported algorithm.
    pub async fn add_room_key(
        &self,
        sender_key: &str,
        signing_key: &str,
        content: &RoomKeyContent,
    ) -> GroupResult<Option<InboundGroupSession>> {
        if content.algorithm != EventEncryptionAlgorithm::GroupV1 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(None);
        }

        let session = InboundGroupSession::new(
            self.provider(),
            sender_key,
            signing_key,
            &content.room_id,
            &content.session_key,
        )?;

        debug!(
            room_id = %content.room_id,
            session_id = session.session_id(),
            "Received a new room key"
        );

        self.store.save_inbound_group_session(session.clone()).await?;

        Ok(Some(session))
    }

    /// Decrypt an event from a room timeline.
    ///
    /// # Arguments
    ///
    /// * `event` - The event that should be decrypted.
    ///
    /// * `timeline` - The id of the timeline the event is decrypted in, used
    /// to detect replays.
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
        timeline: &str,
    ) -> GroupResult<DecryptedEvent> {
        let content = &event.content;

        if content.algorithm != EventEncryptionAlgorithm::GroupV1 {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let session = self
            .store
            .get_inbound_group_session(&content.session_id, &content.sender_key)
            .await?
            .ok_or(GroupError::MissingSession)?;

        // The session was looked up by (session id, sender key) alone; make
        // sure the key actually belongs to the room the event claims to be
        // from before trusting the plaintext.
        if session.room_id() != &event.room_id {
            return Err(
                EventError::MismatchedRoom(session.room_id().clone(), event.room_id.clone())
                    .into(),
            );
        }

        let (plaintext, message_index) = session.decrypt_helper(&content.ciphertext).await?;

        self.check_for_replay(event, timeline, message_index)?;

        let payload: GroupMessagePayload = serde_json::from_str(&plaintext)?;

        Ok(DecryptedEvent {
            event_type: payload.event_type,
            content: payload.content,
            encryption_info: EncryptionInfo {
                sender: event.sender.clone(),
                sender_curve25519_key: content.sender_key.clone(),
                claimed_ed25519_key: Some(session.signing_key().to_owned()),
                forwarding_curve25519_key_chain: session.forwarding_key_chain().to_vec(),
            },
        })
    }

    /// Record the message index an event decrypted at, detecting replays.
    ///
    /// Re-decrypting the same event id at the same index is idempotent; a
    /// *different* event id arriving at an already consumed index is an
    /// attack and fails loudly.
    fn check_for_replay(
        &self,
        event: &EncryptedEvent,
        timeline: &str,
        message_index: u32,
    ) -> GroupResult<()> {
        let content = &event.content;
        let index_key =
            format!("{}|{}|{}", content.sender_key, content.session_id, message_index);

        let mut timeline_guard = self.replay_guard.entry(timeline.to_owned()).or_default();

        match timeline_guard.get(&index_key) {
            Some(known_event_id) if known_event_id != &event.event_id => {
                warn!(
                    event_id = %event.event_id,
                    known_event_id = %known_event_id,
                    session_id = content.session_id,
                    message_index,
                    "Replay attack detected, the message index was already used \
                     by a different event in this timeline"
                );

                Err(GroupError::ReplayAttack {
                    event_id: event.event_id.clone(),
                    known_event_id: known_event_id.clone(),
                    session_id: content.session_id.clone(),
                    message_index,
                })
            }
            Some(_) => Ok(()),
            None => {
                timeline_guard.insert(index_key, event.event_id.clone());
                Ok(())
            }
        }
    }

    /// Forget which events have been decrypted in the given timeline.
    ///
    /// Used when a timeline is discarded and recreated, e.g. after a gapped
    /// sync; previously seen event ids are treated as unseen again.
    pub fn reset_replay_check(&self, timeline: &str) {
        self.replay_guard.remove(timeline);
    }

    /// Export every inbound group session the store holds.
    pub async fn export_room_keys(&self) -> GroupResult<Vec<ExportedRoomKey>> {
        let mut keys = Vec::new();

        for session in self.store.get_inbound_group_sessions().await? {
            keys.push(session.export().await?);
        }

        Ok(keys)
    }

    /// Store the given room keys, merging them with any existing sessions.
    ///
    /// A key for an already known (session id, sender key) pair is only
    /// applied if it extends how far back the session can decrypt; a
    /// session's advancement is never regressed.
    pub async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
    ) -> GroupResult<RoomKeyImportResult> {
        let total_count = keys.len();
        let mut imported_count = 0;

        for key in keys {
            let session = InboundGroupSession::from_export(self.provider(), &key)?;

            let existing = self
                .store
                .get_inbound_group_session(session.session_id(), session.sender_key())
                .await?;

            if let Some(existing) = existing {
                if existing.first_known_index() <= session.first_known_index() {
                    debug!(
                        session_id = session.session_id(),
                        "Skipping room key import, we have a better version of this session"
                    );
                    continue;
                }
            }

            self.store.save_inbound_group_session(session).await?;
            imported_count += 1;
        }

        info!(imported_count, total_count, "Imported room keys");

        Ok(RoomKeyImportResult { imported_count, total_count })
    }

    fn provider(&self) -> Arc<dyn crate::provider::CryptoProvider> {
        self.account.provider()
    }
}
