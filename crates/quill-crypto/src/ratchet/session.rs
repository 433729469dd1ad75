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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    error::PairwiseResult,
    events::{PairwisePayload, ToDeviceEncryptedContent},
    identities::Device,
    provider::{CreatedSession, CryptoProvider, IdentityKeys, RatchetMessage, SessionState},
    types::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, UserId},
    utilities::timestamp_millis,
};

/// A pairwise encrypted channel to one specific remote device.
///
/// The ratchet state is advanced in place on every use; the inner mutex
/// enforces the single-writer discipline, two tasks can never advance the
/// same session concurrently.
#[derive(Clone)]
pub struct Session {
    provider: Arc<dyn CryptoProvider>,
    our_user_id: Arc<UserId>,
    our_identity_keys: Arc<IdentityKeys>,
    inner: Arc<Mutex<SessionState>>,
    session_id: Arc<String>,
    /// The curve25519 key of the remote device.
    pub(crate) sender_key: Arc<String>,
    /// When the session was established, in milliseconds since the epoch.
    creation_time: u64,
    /// When the session last encrypted or decrypted a message.
    last_use_time: Arc<AtomicU64>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        provider: Arc<dyn CryptoProvider>,
        our_user_id: Arc<UserId>,
        our_identity_keys: Arc<IdentityKeys>,
        created: CreatedSession,
        sender_key: &str,
    ) -> Self {
        let now = timestamp_millis();

        Self {
            provider,
            our_user_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(created.state)),
            session_id: Arc::new(created.session_id),
            sender_key: Arc::new(sender_key.to_owned()),
            creation_time: now,
            last_use_time: Arc::new(AtomicU64::new(now)),
        }
    }

    /// The unique id of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 key of the remote device this session talks to.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// When the session was established, in milliseconds since the epoch.
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    /// When the session was last used, in milliseconds since the epoch.
    pub fn last_use_time(&self) -> u64 {
        self.last_use_time.load(Ordering::SeqCst)
    }

    fn mark_as_used(&self) {
        self.last_use_time.store(timestamp_millis(), Ordering::SeqCst);
    }

    /// Encrypt the given plaintext, advancing the ratchet.
    pub(crate) async fn encrypt_helper(&self, plaintext: &str) -> PairwiseResult<RatchetMessage> {
        let mut state = self.inner.lock().await;
        let message = self.provider.session_encrypt(&mut state, plaintext)?;
        self.mark_as_used();

        Ok(message)
    }

    /// Encrypt an event for the given recipient device.
    ///
    /// The sender and recipient identities are bound into the plaintext, see
    /// [`PairwisePayload`].
    pub async fn encrypt(
        &self,
        recipient_device: &Device,
        event_type: &str,
        content: Value,
    ) -> PairwiseResult<ToDeviceEncryptedContent> {
        let recipient_signing_key = recipient_device.get_key(DeviceKeyAlgorithm::Ed25519);

        let payload = PairwisePayload {
            sender: (*self.our_user_id).clone(),
            recipient: recipient_device.user_id().clone(),
            keys: BTreeMap::from([(
                DeviceKeyAlgorithm::Ed25519,
                self.our_identity_keys.ed25519().to_owned(),
            )]),
            recipient_keys: recipient_signing_key
                .map(|k| BTreeMap::from([(DeviceKeyAlgorithm::Ed25519, k.to_owned())]))
                .unwrap_or_default(),
            event_type: event_type.to_owned(),
            content,
        };

        let plaintext = serde_json::to_string(&payload)?;
        let message = self.encrypt_helper(&plaintext).await?;

        Ok(ToDeviceEncryptedContent {
            algorithm: EventEncryptionAlgorithm::RatchetV1,
            sender_key: self.our_identity_keys.curve25519().to_owned(),
            ciphertext: BTreeMap::from([(self.sender_key.to_string(), message)]),
        })
    }

    /// Decrypt the given message, advancing the ratchet.
    pub async fn decrypt(&self, message: &RatchetMessage) -> PairwiseResult<String> {
        let mut state = self.inner.lock().await;
        let plaintext = self.provider.session_decrypt(&mut state, message)?;
        self.mark_as_used();

        Ok(plaintext)
    }

    /// Check if the given pre-key message was encrypted for this session.
    pub async fn matches(
        &self,
        their_identity_key: &str,
        message: &str,
    ) -> PairwiseResult<bool> {
        let mut state = self.inner.lock().await;
        Ok(self.provider.session_matches(&mut state, their_identity_key, message)?)
    }

    /// Serialize the session for storage.
    pub async fn pickle(&self) -> PickledSession {
        PickledSession {
            pickle: self.inner.lock().await.clone(),
            session_id: self.session_id.to_string(),
            sender_key: self.sender_key.to_string(),
            creation_time: self.creation_time,
            last_use_time: self.last_use_time(),
        }
    }

    /// Restore a session from a previously pickled one.
    ///
    /// The identity keys of the owning account need to be supplied since the
    /// pickle only stores the remote side.
    pub fn from_pickle(
        provider: Arc<dyn CryptoProvider>,
        our_user_id: Arc<UserId>,
        our_identity_keys: Arc<IdentityKeys>,
        pickle: PickledSession,
    ) -> Self {
        Self {
            provider,
            our_user_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(pickle.pickle)),
            session_id: Arc::new(pickle.session_id),
            sender_key: Arc::new(pickle.sender_key),
            creation_time: pickle.creation_time,
            last_use_time: Arc::new(AtomicU64::new(pickle.last_use_time)),
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A serialized pairwise session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledSession {
    /// The serialized ratchet state.
    pub pickle: SessionState,
    /// The unique id of the session.
    pub session_id: String,
    /// The curve25519 key of the remote device.
    pub sender_key: String,
    /// When the session was established, in milliseconds since the epoch.
    pub creation_time: u64,
    /// When the session was last used, in milliseconds since the epoch.
    pub last_use_time: u64,
}
