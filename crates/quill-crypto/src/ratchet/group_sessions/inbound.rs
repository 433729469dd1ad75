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

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::ExportedRoomKey;
use crate::{
    error::GroupResult,
    provider::{CryptoProvider, GroupSessionKey, GroupSessionState},
    types::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, RoomId},
};

/// The receiver side of a room key.
///
/// Inbound group sessions decrypt the room messages of a single sender. At
/// most one live instance exists per (session id, sender key); the inner
/// mutex enforces the single-writer discipline on the ratchet state.
#[derive(Clone)]
pub struct InboundGroupSession {
    provider: Arc<dyn CryptoProvider>,
    inner: Arc<Mutex<GroupSessionState>>,
    session_id: Arc<String>,
    /// The curve25519 key of the device that created the session.
    pub(crate) sender_key: Arc<String>,
    /// The ed25519 key the sender claimed when we received the session.
    pub(crate) signing_key: Arc<String>,
    /// The room the session belongs to.
    pub(crate) room_id: Arc<RoomId>,
    /// The chain of curve25519 keys the session was forwarded through.
    forwarding_chains: Arc<Vec<String>>,
    first_known_index: u32,
    imported: bool,
}

impl InboundGroupSession {
    /// Create a new inbound group session from a directly received session
    /// key.
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        sender_key: &str,
        signing_key: &str,
        room_id: &RoomId,
        session_key: &GroupSessionKey,
    ) -> GroupResult<Self> {
        let created = provider.create_inbound_group_session(session_key)?;

        Ok(Self {
            provider,
            inner: Arc::new(Mutex::new(created.state)),
            session_id: Arc::new(created.session_id),
            sender_key: Arc::new(sender_key.to_owned()),
            signing_key: Arc::new(signing_key.to_owned()),
            room_id: Arc::new(room_id.clone()),
            forwarding_chains: Arc::new(Vec::new()),
            first_known_index: created.first_known_index,
            imported: false,
        })
    }

    /// Restore an inbound group session from an exported room key.
    pub fn from_export(
        provider: Arc<dyn CryptoProvider>,
        key: &ExportedRoomKey,
    ) -> GroupResult<Self> {
        let created = provider.import_inbound_group_session(&key.session_key)?;

        let signing_key = key
            .sender_claimed_keys
            .get(&DeviceKeyAlgorithm::Ed25519)
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            provider,
            inner: Arc::new(Mutex::new(created.state)),
            session_id: Arc::new(created.session_id),
            sender_key: Arc::new(key.sender_key.clone()),
            signing_key: Arc::new(signing_key),
            room_id: Arc::new(key.room_id.clone()),
            forwarding_chains: Arc::new(key.forwarding_curve25519_key_chain.clone()),
            first_known_index: created.first_known_index,
            imported: true,
        })
    }

    /// The unique id of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// The ed25519 key the sender claimed when we received the session.
    pub fn signing_key(&self) -> &str {
        &self.signing_key
    }

    /// The room the session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The chain of curve25519 keys the session was forwarded through, empty
    /// if we received the session directly from its creator.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_chains
    }

    /// The first message index this session is able to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Did this session arrive through an import rather than directly from
    /// the sender.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Decrypt the given ciphertext, returning the plaintext and the message
    /// index the ciphertext was encrypted at.
    pub async fn decrypt_helper(&self, ciphertext: &str) -> GroupResult<(String, u32)> {
        let mut state = self.inner.lock().await;
        Ok(self.provider.group_decrypt(&mut state, ciphertext)?)
    }

    /// Export the session at its first known index.
    pub async fn export(&self) -> GroupResult<ExportedRoomKey> {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export the session at the given message index.
    pub async fn export_at_index(&self, message_index: u32) -> GroupResult<ExportedRoomKey> {
        let state = self.inner.lock().await;
        let session_key = self.provider.export_inbound_group_session(&state, message_index)?;

        Ok(ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::GroupV1,
            room_id: (*self.room_id).clone(),
            sender_key: self.sender_key.to_string(),
            session_id: self.session_id.to_string(),
            session_key,
            sender_claimed_keys: BTreeMap::from([(
                DeviceKeyAlgorithm::Ed25519,
                self.signing_key.to_string(),
            )]),
            forwarding_curve25519_key_chain: self.forwarding_chains.to_vec(),
        })
    }

    /// Serialize the session for storage.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.lock().await.clone(),
            session_id: self.session_id.to_string(),
            sender_key: self.sender_key.to_string(),
            signing_key: self.signing_key.to_string(),
            room_id: (*self.room_id).clone(),
            forwarding_chains: self.forwarding_chains.to_vec(),
            first_known_index: self.first_known_index,
            imported: self.imported,
        }
    }

    /// Restore a session from a previously pickled one.
    pub fn from_pickle(
        provider: Arc<dyn CryptoProvider>,
        pickle: PickledInboundGroupSession,
    ) -> Self {
        Self {
            provider,
            inner: Arc::new(Mutex::new(pickle.pickle)),
            session_id: Arc::new(pickle.session_id),
            sender_key: Arc::new(pickle.sender_key),
            signing_key: Arc::new(pickle.signing_key),
            room_id: Arc::new(pickle.room_id),
            forwarding_chains: Arc::new(pickle.forwarding_chains),
            first_known_index: pickle.first_known_index,
            imported: pickle.imported,
        }
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession").field("session_id", &self.session_id()).finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A serialized inbound group session, holding everything that needs to hit
/// the store to restore the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    /// The serialized ratchet state.
    pub pickle: GroupSessionState,
    /// The unique id of the session.
    pub session_id: String,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The ed25519 key the sender claimed when we received the session.
    pub signing_key: String,
    /// The room the session belongs to.
    pub room_id: RoomId,
    /// The chain of curve25519 keys the session was forwarded through.
    #[serde(default)]
    pub forwarding_chains: Vec<String>,
    /// The first message index the session is able to decrypt.
    pub first_known_index: u32,
    /// Did the session arrive through an import.
    #[serde(default)]
    pub imported: bool,
}
