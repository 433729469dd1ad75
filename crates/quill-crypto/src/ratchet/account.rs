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
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    group_sessions::{EncryptionSettings, InboundGroupSession, OutboundGroupSession},
    Session,
};
use crate::{
    error::{GroupResult, PairwiseResult},
    provider::{AccountState, CryptoProvider, IdentityKeys},
    types::{DeviceId, RoomId, UserId},
    utilities::timestamp_millis,
};

/// The long-term identity of the local device.
///
/// Created once when encryption is first enabled and never rotated for the
/// lifetime of the logged-in device. The identity keys are immutable after
/// creation.
#[derive(Clone)]
pub struct Account {
    provider: Arc<dyn CryptoProvider>,
    user_id: Arc<UserId>,
    device_id: Arc<DeviceId>,
    identity_keys: Arc<IdentityKeys>,
    inner: Arc<Mutex<AccountState>>,
    shared: Arc<AtomicBool>,
    uploaded_key_count: Arc<AtomicU64>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    /// Create a fresh account for the given user and device.
    pub fn new(provider: Arc<dyn CryptoProvider>, user_id: &UserId, device_id: &DeviceId) -> Self {
        let created = provider.create_account();

        debug!(%user_id, %device_id, "Created a new account");

        Self {
            provider,
            user_id: Arc::new(user_id.clone()),
            device_id: Arc::new(device_id.clone()),
            identity_keys: Arc::new(created.identity_keys),
            inner: Arc::new(Mutex::new(created.state)),
            shared: Arc::new(AtomicBool::new(false)),
            uploaded_key_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The user that owns the account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device that holds the account.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    /// The provider the account delegates its ratchet operations to.
    pub(crate) fn provider(&self) -> Arc<dyn CryptoProvider> {
        self.provider.clone()
    }

    /// Have the account's device keys been uploaded to the server.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the account's device keys as uploaded.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// The number of one-time keys the server currently holds for us.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_key_count.load(Ordering::SeqCst)
    }

    /// Update the count of one-time keys the server holds for us.
    pub fn update_uploaded_key_count(&self, count: u64) {
        self.uploaded_key_count.store(count, Ordering::SeqCst);
    }

    /// Should new device or one-time keys be uploaded to the server.
    pub fn should_upload_keys(&self) -> bool {
        !self.shared()
    }

    /// Generate `count` new one-time keys, returning a map from key id to
    /// key.
    pub async fn generate_one_time_keys(
        &self,
        count: usize,
    ) -> PairwiseResult<BTreeMap<String, String>> {
        let mut state = self.inner.lock().await;
        Ok(self.provider.generate_one_time_keys(&mut state, count)?)
    }

    /// Discard the unpublished one-time keys after a successful upload.
    pub async fn mark_keys_as_published(&self) -> PairwiseResult<()> {
        let mut state = self.inner.lock().await;
        Ok(self.provider.mark_keys_as_published(&mut state)?)
    }

    /// Establish an outbound session with the device owning the given
    /// identity key.
    pub async fn create_outbound_session(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
    ) -> PairwiseResult<Session> {
        let state = self.inner.lock().await;
        let created =
            self.provider.create_outbound_session(&state, their_identity_key, their_one_time_key)?;

        debug!(
            sender_key = their_identity_key,
            session_id = created.session_id.as_str(),
            "Created a new outbound session"
        );

        Ok(Session::new(
            self.provider.clone(),
            self.user_id.clone(),
            self.identity_keys.clone(),
            created,
            their_identity_key,
        ))
    }

    /// Establish an inbound session from a received pre-key message,
    /// returning the session and the plaintext of the message.
    pub async fn create_inbound_session(
        &self,
        their_identity_key: &str,
        message: &str,
    ) -> PairwiseResult<(Session, String)> {
        let mut state = self.inner.lock().await;
        let created = self.provider.create_inbound_session(&mut state, their_identity_key, message)?;

        debug!(
            sender_key = their_identity_key,
            session_id = created.session.session_id.as_str(),
            "Created a new inbound session"
        );

        let session = Session::new(
            self.provider.clone(),
            self.user_id.clone(),
            self.identity_keys.clone(),
            created.session,
            their_identity_key,
        );

        Ok((session, created.plaintext))
    }

    /// Create a new outbound group session for a room, together with the
    /// inbound counterpart that lets us decrypt our own messages.
    pub async fn create_group_session_pair(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> GroupResult<(OutboundGroupSession, InboundGroupSession)> {
        debug!(%room_id, "Creating a new group session pair");

        let created = self.provider.create_group_session();

        let inbound = InboundGroupSession::new(
            self.provider.clone(),
            self.identity_keys.curve25519(),
            self.identity_keys.ed25519(),
            room_id,
            &created.session_key,
        )?;

        let outbound = OutboundGroupSession::new(
            self.provider.clone(),
            self.device_id.clone(),
            self.identity_keys.clone(),
            room_id,
            created,
            settings,
        );

        Ok((outbound, inbound))
    }

    /// Serialize the account for storage.
    pub async fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: (*self.user_id).clone(),
            device_id: (*self.device_id).clone(),
            identity_keys: (*self.identity_keys).clone(),
            pickle: self.inner.lock().await.clone(),
            shared: self.shared(),
            uploaded_key_count: self.uploaded_key_count(),
            creation_time: timestamp_millis(),
        }
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(provider: Arc<dyn CryptoProvider>, pickle: PickledAccount) -> Self {
        Self {
            provider,
            user_id: Arc::new(pickle.user_id),
            device_id: Arc::new(pickle.device_id),
            identity_keys: Arc::new(pickle.identity_keys),
            inner: Arc::new(Mutex::new(pickle.pickle)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            uploaded_key_count: Arc::new(AtomicU64::new(pickle.uploaded_key_count)),
        }
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys == other.identity_keys && self.shared() == other.shared()
    }
}

/// A serialized account, holding everything that needs to hit the store to
/// restore the account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: UserId,
    /// The device id of the account owner.
    pub device_id: DeviceId,
    /// The public identity keys of the account.
    pub identity_keys: IdentityKeys,
    /// The serialized account state.
    pub pickle: AccountState,
    /// Whether the device keys have been uploaded.
    pub shared: bool,
    /// The number of one-time keys the server holds for us.
    pub uploaded_key_count: u64,
    /// The time the pickle was created, in milliseconds since the epoch.
    pub creation_time: u64,
}
