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

//! Types and traits to implement the storage layer for the
//! [`CryptoMachine`].
//!
//! An in-memory only store is provided as well as a sled based one; a custom
//! store may be implemented behind the same [`CryptoStore`] trait.
//!
//! [`CryptoMachine`]: crate::machine::CryptoMachine

use std::{collections::HashMap, fmt::Debug, io::Error as IoError, sync::Arc};

use async_trait::async_trait;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    identities::{Device, LocalTrust, UserDevices},
    ratchet::{Account, InboundGroupSession, Session},
    types::{DeviceId, EventEncryptionAlgorithm, RoomId, UserId},
};

pub mod caches;
mod memorystore;
#[cfg(feature = "sled_cryptostore")]
mod sled;

pub use memorystore::MemoryStore;
#[cfg(feature = "sled_cryptostore")]
pub use self::sled::SledStore;

/// Error type for the storage layer.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// The underlying medium can't be read or written.
    #[error("can't read or write from the store")]
    Io(#[from] IoError),

    /// A session or group session was stored or loaded before the account.
    #[error("can't save or load sessions in the store before an account is stored")]
    AccountUnset,

    /// A value couldn't be (de)serialized for the store.
    #[error("error serializing data for the store")]
    Serialization(#[from] SerdeError),

    /// The on-disk data was written by a newer, incompatible version of the
    /// store.
    #[error("the store is using an unsupported schema version, found {0}, expected at most {1}")]
    UnsupportedStoreVersion(usize, usize),

    /// A verification state change was requested for a device the store
    /// doesn't know about.
    #[error("the device {1} of user {0} is unknown to the store")]
    UnknownDevice(UserId, DeviceId),

    /// The background task running a blocking store operation was aborted.
    #[error("the store task was aborted before it could finish")]
    TaskAborted,

    /// The underlying database returned an error.
    #[cfg(feature = "sled_cryptostore")]
    #[error("the underlying database returned an error: {0}")]
    Database(#[from] ::sled::Error),
}

/// The result type for the storage layer.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Represents a store that the [`CryptoMachine`] uses to store E2EE data,
/// such as cryptographic keys.
///
/// A store is only usable after it has been successfully opened; every
/// operation fails loudly if the underlying medium can't satisfy it, a
/// silently dropped session write would be a security relevant data loss.
///
/// [`CryptoMachine`]: crate::machine::CryptoMachine
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Load the account that was previously stored.
    async fn load_account(&self) -> Result<Option<Account>>;

    /// Save the given account in the store.
    ///
    /// # Arguments
    ///
    /// * `account` - The account that should be stored.
    async fn save_account(&self, account: Account) -> Result<()>;

    /// Save the device id of the account owner.
    async fn save_device_id(&self, device_id: &DeviceId) -> Result<()>;

    /// Load the stored device id, if any.
    async fn load_device_id(&self) -> Result<Option<DeviceId>>;

    /// Raise the flag remembering that this device announced itself to the
    /// other devices. One way: once set, the flag stays set for the lifetime
    /// of the store.
    async fn set_device_announced(&self) -> Result<()>;

    /// Check if the device-announced flag has been raised.
    async fn is_device_announced(&self) -> Result<bool>;

    /// Replace the map of devices of the given user wholesale.
    ///
    /// Existing records for the same device ids are overwritten; callers
    /// must have merged verification state beforehand if they want to keep
    /// it.
    async fn save_devices_for_user(
        &self,
        user_id: &UserId,
        devices: HashMap<DeviceId, Device>,
    ) -> Result<()>;

    /// Save a single device, replacing a previous record with the same id.
    async fn save_device(&self, device: Device) -> Result<()>;

    /// Get the device with the given id belonging to the given user.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>>;

    /// Get all the devices of the given user.
    ///
    /// Returns `None` if the user's device list was never fetched, which is
    /// distinct from `Some` with an empty map, a fetched user that owns zero
    /// devices.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<Option<UserDevices>>;

    /// Store the encryption algorithm of a room.
    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()>;

    /// The encryption algorithm of a room, `None` if the room isn't
    /// encrypted.
    async fn get_room_algorithm(&self, room_id: &RoomId)
        -> Result<Option<EventEncryptionAlgorithm>>;

    /// Save the given sessions in the store.
    ///
    /// # Arguments
    ///
    /// * `sessions` - The sessions that should be stored.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// Get all the pairwise sessions established with the device owning the
    /// given curve25519 key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Save the given inbound group session in the store.
    ///
    /// Returns true if no session with the same (session id, sender key)
    /// existed before, false if an existing one was replaced.
    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool>;

    /// Get the inbound group session with the given id that the given sender
    /// key sent us.
    async fn get_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all inbound group sessions the store holds.
    ///
    /// This loads every session; avoid calling it on hot paths.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Remove the inbound group session with the given id and sender key.
    ///
    /// Administrative and test use.
    async fn remove_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<()>;
}

/// A registry over a [`CryptoStore`].
///
/// Adds the device/session lookup conveniences the rest of the crate needs
/// on top of the raw store operations. The registry never holds data the
/// store doesn't also hold: every mutation writes through to the backing
/// store before it becomes visible.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<dyn CryptoStore>,
    verification_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Wrap the given store.
    pub fn new(inner: Arc<dyn CryptoStore>) -> Self {
        Self { inner, verification_lock: Arc::new(Mutex::new(())) }
    }

    /// The most recently used session with the device owning the given
    /// curve25519 key, falling back to the most recently created one if
    /// recency of use is tied or unknown.
    pub async fn best_session_for_device(&self, sender_key: &str) -> Result<Option<Session>> {
        let Some(sessions) = self.inner.get_sessions(sender_key).await? else {
            return Ok(None);
        };

        let sessions = sessions.lock().await;
        let best = sessions
            .iter()
            .max_by_key(|s| (s.last_use_time(), s.creation_time()))
            .cloned();

        Ok(best)
    }

    /// Update the local trust of a device.
    ///
    /// The new state is persisted before it becomes visible to readers;
    /// concurrent updates for the same device serialize, the last committed
    /// one wins.
    pub async fn set_device_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Result<()> {
        let _guard = self.verification_lock.lock().await;

        let device = self
            .inner
            .get_device(user_id, device_id)
            .await?
            .ok_or_else(|| CryptoStoreError::UnknownDevice(user_id.clone(), device_id.clone()))?;

        let updated = Device::new(
            device.user_id().clone(),
            device.device_id().clone(),
            device.display_name().map(|d| d.to_owned()),
            trust,
            device.algorithms().to_vec(),
            device.keys().clone(),
        );

        self.inner.save_device(updated).await
    }

    /// Store the encryption algorithm of a room.
    ///
    /// The algorithm is set once; an attempt to change it afterwards is
    /// rejected to rule out downgrades.
    pub async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()> {
        match self.inner.get_room_algorithm(room_id).await? {
            Some(existing) if existing != algorithm => {
                warn!(
                    %room_id, %existing, new = %algorithm,
                    "Ignoring an attempt to change the encryption algorithm of a room"
                );
                Ok(())
            }
            Some(_) => Ok(()),
            None => self.inner.set_room_algorithm(room_id, algorithm).await,
        }
    }
}

impl std::ops::Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{CryptoStoreError, MemoryStore, Store};
    use crate::{
        identities::{device::testing::get_device, LocalTrust},
        ratchet::Account,
        testing::TestProvider,
        types::EventEncryptionAlgorithm,
    };

    fn get_store() -> Store {
        Store::new(Arc::new(MemoryStore::new()))
    }

    async fn account_pair() -> (Account, Account) {
        let provider = Arc::new(TestProvider::new());
        let alice =
            Account::new(provider.clone(), &"@alice:example.org".into(), &"ALICEDEVICE".into());
        let bob = Account::new(provider, &"@bob:example.org".into(), &"BOBDEVICE".into());

        (alice, bob)
    }

    #[tokio::test]
    async fn best_session_prefers_the_most_recently_used() {
        let store = get_store();
        let (alice, bob) = account_pair().await;

        let sender_key = bob.identity_keys().curve25519().to_owned();

        let first = alice.create_outbound_session(&sender_key, "otk_1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = alice.create_outbound_session(&sender_key, "otk_2").await.unwrap();

        store.save_sessions(&[first.clone(), second.clone()]).await.unwrap();

        // Without any use, the most recently created session wins.
        let best = store.best_session_for_device(&sender_key).await.unwrap().unwrap();
        assert_eq!(best.session_id(), second.session_id());

        // Using the older session makes it the preferred one.
        tokio::time::sleep(Duration::from_millis(5)).await;
        first.encrypt_helper("plaintext").await.unwrap();
        store.save_sessions(&[first.clone()]).await.unwrap();

        let best = store.best_session_for_device(&sender_key).await.unwrap().unwrap();
        assert_eq!(best.session_id(), first.session_id());
    }

    #[tokio::test]
    async fn verification_writes_through() {
        let store = get_store();
        let device = get_device();

        store
            .save_devices_for_user(
                device.user_id(),
                [(device.device_id().clone(), device.clone())].into(),
            )
            .await
            .unwrap();

        store
            .set_device_verification(device.user_id(), device.device_id(), LocalTrust::Verified)
            .await
            .unwrap();

        let loaded = store.get_device(device.user_id(), device.device_id()).await.unwrap().unwrap();
        assert!(loaded.is_verified());

        // Blocked is sticky until an explicit change.
        store
            .set_device_verification(device.user_id(), device.device_id(), LocalTrust::Blocked)
            .await
            .unwrap();
        let loaded = store.get_device(device.user_id(), device.device_id()).await.unwrap().unwrap();
        assert!(loaded.is_blocked());
    }

    #[tokio::test]
    async fn verifying_an_unknown_device_fails() {
        let store = get_store();

        let result = store
            .set_device_verification(
                &"@nobody:example.org".into(),
                &"NODEVICE".into(),
                LocalTrust::Verified,
            )
            .await;

        assert!(matches!(result, Err(CryptoStoreError::UnknownDevice(_, _))));
    }

    #[tokio::test]
    async fn algorithm_downgrade_is_ignored() {
        let store = get_store();
        let room_id = "!room:example.org".into();

        store.set_room_algorithm(&room_id, EventEncryptionAlgorithm::GroupV1).await.unwrap();
        store
            .set_room_algorithm(&room_id, EventEncryptionAlgorithm::Unsupported("weak".into()))
            .await
            .unwrap();

        assert_eq!(
            store.get_room_algorithm(&room_id).await.unwrap().unwrap(),
            EventEncryptionAlgorithm::GroupV1
        );
    }
}
