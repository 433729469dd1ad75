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

mod inbound;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};

use crate::{
    error::GroupResult,
    events::{EncryptedEventContent, GroupMessagePayload, RoomKeyContent},
    provider::{
        CreatedGroupSession, CryptoProvider, ExportedSessionKey, GroupSessionKey,
        GroupSessionState, IdentityKeys,
    },
    types::{DeviceId, DeviceKeyAlgorithm, EventEncryptionAlgorithm, RoomId},
    utilities::timestamp_millis,
};

const ROTATION_PERIOD: Duration = Duration::from_secs(7 * 24 * 3600);
const ROTATION_MESSAGES: u64 = 100;

/// Settings for an encrypted room.
#[derive(Clone, Debug)]
pub struct EncryptionSettings {
    /// The algorithm room messages are encrypted with.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long an outbound group session is used before it gets rotated.
    pub rotation_period: Duration,
    /// How many messages an outbound group session encrypts before it gets
    /// rotated.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::GroupV1,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

/// The sender side of a room key.
///
/// Outbound group sessions encrypt room messages for every member at once.
/// They are kept in memory only; the matching [`InboundGroupSession`] is what
/// hits the store.
#[derive(Clone)]
pub struct OutboundGroupSession {
    provider: Arc<dyn CryptoProvider>,
    device_id: Arc<DeviceId>,
    our_identity_keys: Arc<IdentityKeys>,
    inner: Arc<Mutex<GroupSessionState>>,
    session_id: Arc<String>,
    room_id: Arc<RoomId>,
    creation_time: u64,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl OutboundGroupSession {
    pub(crate) fn new(
        provider: Arc<dyn CryptoProvider>,
        device_id: Arc<DeviceId>,
        our_identity_keys: Arc<IdentityKeys>,
        room_id: &RoomId,
        created: CreatedGroupSession,
        settings: EncryptionSettings,
    ) -> Self {
        Self {
            provider,
            device_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(created.state)),
            session_id: Arc::new(created.session_id),
            room_id: Arc::new(room_id.clone()),
            creation_time: timestamp_millis(),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
        }
    }

    /// The unique id of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room this session encrypts messages for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Has the session key been shared with the room members.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the session key as shared with the room members.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// Has the session encrypted enough messages or lived long enough that
    /// it needs to be rotated.
    pub fn expired(&self) -> bool {
        let elapsed = timestamp_millis().saturating_sub(self.creation_time);

        self.message_count.load(Ordering::SeqCst) >= self.settings.rotation_period_msgs
            || Duration::from_millis(elapsed) >= self.settings.rotation_period
    }

    /// The key material recipients need to decrypt messages of this session,
    /// exported at the current ratchet index.
    pub async fn session_key(&self) -> GroupResult<GroupSessionKey> {
        let state = self.inner.lock().await;
        Ok(self.provider.group_session_key(&state)?)
    }

    /// The room key content to share with the room members.
    pub async fn as_room_key_content(&self) -> GroupResult<RoomKeyContent> {
        Ok(RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::GroupV1,
            room_id: (*self.room_id).clone(),
            session_id: self.session_id.to_string(),
            session_key: self.session_key().await?,
        })
    }

    /// Encrypt an event for the room, advancing the ratchet.
    pub async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> GroupResult<EncryptedEventContent> {
        let payload = GroupMessagePayload {
            room_id: (*self.room_id).clone(),
            event_type: event_type.to_owned(),
            content,
        };
        let plaintext = serde_json::to_string(&payload)?;

        let mut state = self.inner.lock().await;
        let (ciphertext, _) = self.provider.group_encrypt(&mut state, &plaintext)?;
        self.message_count.fetch_add(1, Ordering::SeqCst);

        Ok(EncryptedEventContent {
            algorithm: EventEncryptionAlgorithm::GroupV1,
            sender_key: self.our_identity_keys.curve25519().to_owned(),
            device_id: (*self.device_id).clone(),
            session_id: self.session_id.to_string(),
            ciphertext,
        })
    }
}

/// A room key descriptor that can rebuild an inbound group session on
/// another device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The algorithm the session is used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session belongs to.
    pub room_id: RoomId,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The unique id of the session.
    pub session_id: String,
    /// The key material, exported at the session's first known index.
    pub session_key: ExportedSessionKey,
    /// The keys the sender claimed to own, at minimum the ed25519 signing
    /// key.
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The chain of curve25519 keys the session was forwarded through, empty
    /// if the session was received directly.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}
