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
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use sled::{Batch, Db, Tree};
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::debug;

use super::{
    caches::{GroupSessionStore, SessionStore},
    CryptoStore, CryptoStoreError, Result,
};
use crate::{
    identities::{Device, UserDevices},
    provider::{CryptoProvider, IdentityKeys},
    ratchet::{
        Account, InboundGroupSession, PickledAccount, PickledInboundGroupSession, PickledSession,
        Session,
    },
    types::{DeviceId, EventEncryptionAlgorithm, RoomId, UserId},
};

/// The name of the directory the store creates under the path it's opened
/// with.
const DATABASE_NAME: &str = "quill-crypto-store";
const DATABASE_VERSION: u8 = 1;

const ACCOUNT_KEY: &str = "account";
const DEVICE_ID_KEY: &str = "device_id";
const DEVICE_ANNOUNCED_KEY: &str = "device_announced";
const VERSION_KEY: &str = "store_version";

trait EncodeKey {
    const SEPARATOR: u8 = 0xff;
    fn encode(&self) -> Vec<u8>;
}

impl EncodeKey for str {
    fn encode(&self) -> Vec<u8> {
        [self.as_bytes(), &[Self::SEPARATOR]].concat()
    }
}

impl EncodeKey for UserId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for RoomId {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl EncodeKey for (&str, &str) {
    fn encode(&self) -> Vec<u8> {
        [self.0.as_bytes(), &[Self::SEPARATOR], self.1.as_bytes(), &[Self::SEPARATOR]].concat()
    }
}

#[derive(Clone)]
struct AccountInfo {
    user_id: Arc<UserId>,
    identity_keys: Arc<IdentityKeys>,
}

/// A [sled] based durable crypto store.
///
/// [sled]: https://github.com/spacejam/sled#readme
#[derive(Clone)]
pub struct SledStore {
    provider: Arc<dyn CryptoProvider>,
    path: PathBuf,
    inner: Db,

    account_info: Arc<RwLock<Option<AccountInfo>>>,
    session_cache: SessionStore,
    group_session_cache: GroupSessionStore,

    account: Tree,
    sessions: Tree,
    inbound_group_sessions: Tree,
    devices: Tree,
    room_settings: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").field("path", &self.path).finish()
    }
}

impl SledStore {
    /// Does the given path hold data of a previously created store.
    ///
    /// Usable without opening the store; true once a store was created at
    /// the path, across close/reopen cycles, until the store is deleted.
    pub fn has_data(path: impl AsRef<Path>) -> bool {
        path.as_ref().join(DATABASE_NAME).exists()
    }

    /// Permanently delete the store at the given path.
    pub async fn delete_store(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().join(DATABASE_NAME);

        if path.exists() {
            spawn_blocking(move || std::fs::remove_dir_all(path))
                .await
                .map_err(|_| CryptoStoreError::TaskAborted)??;
        }

        Ok(())
    }

    /// Open the sled based crypto store at the given path.
    ///
    /// The blocking database open runs on a background thread; the caller's
    /// executor context is never blocked.
    pub async fn open(
        path: impl AsRef<Path>,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let path = path.as_ref().join(DATABASE_NAME);
        let db_path = path.clone();

        let db = spawn_blocking(move || sled::Config::new().path(db_path).open())
            .await
            .map_err(|_| CryptoStoreError::TaskAborted)??;

        SledStore::open_helper(db, path, provider)
    }

    fn open_helper(db: Db, path: PathBuf, provider: Arc<dyn CryptoProvider>) -> Result<Self> {
        let account = db.open_tree("account")?;
        let sessions = db.open_tree("sessions")?;
        let inbound_group_sessions = db.open_tree("inbound_group_sessions")?;
        let devices = db.open_tree("devices")?;
        let room_settings = db.open_tree("room_settings")?;

        let store = Self {
            provider,
            path,
            inner: db,
            account_info: Arc::new(RwLock::new(None)),
            session_cache: SessionStore::new(),
            group_session_cache: GroupSessionStore::new(),
            account,
            sessions,
            inbound_group_sessions,
            devices,
            room_settings,
        };

        store.upgrade()?;

        Ok(store)
    }

    fn upgrade(&self) -> Result<()> {
        let version = self
            .inner
            .get(VERSION_KEY)?
            .and_then(|v| v.first().copied())
            .unwrap_or(DATABASE_VERSION);

        if version > DATABASE_VERSION {
            return Err(CryptoStoreError::UnsupportedStoreVersion(
                version.into(),
                DATABASE_VERSION.into(),
            ));
        }

        if version != DATABASE_VERSION {
            debug!(version, new_version = DATABASE_VERSION, "Upgrading the crypto store");
        }

        self.inner.insert(VERSION_KEY, [DATABASE_VERSION].as_ref())?;
        self.inner.flush()?;

        Ok(())
    }

    fn get_account_info(&self) -> Option<AccountInfo> {
        self.account_info.read().unwrap().clone()
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush_async().await?;
        Ok(())
    }

    fn load_device_map(&self, user_id: &UserId) -> Result<Option<HashMap<DeviceId, Device>>> {
        self.devices
            .get(user_id.encode())?
            .map(|d| serde_json::from_slice(&d).map_err(CryptoStoreError::Serialization))
            .transpose()
    }

    async fn save_device_map(
        &self,
        user_id: &UserId,
        devices: &HashMap<DeviceId, Device>,
    ) -> Result<()> {
        let serialized = serde_json::to_vec(devices)?;
        self.devices.insert(user_id.encode(), serialized)?;
        self.flush().await
    }
}

#[async_trait]
impl CryptoStore for SledStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        let Some(pickle) = self.account.get(ACCOUNT_KEY.encode())? else {
            return Ok(None);
        };

        let pickle: PickledAccount = serde_json::from_slice(&pickle)?;

        debug!(user_id = %pickle.user_id, device_id = %pickle.device_id, "Restored account");

        let account = Account::from_pickle(self.provider.clone(), pickle);

        *self.account_info.write().unwrap() = Some(AccountInfo {
            user_id: Arc::new(account.user_id().clone()),
            identity_keys: Arc::new(account.identity_keys().clone()),
        });

        Ok(Some(account))
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        *self.account_info.write().unwrap() = Some(AccountInfo {
            user_id: Arc::new(account.user_id().clone()),
            identity_keys: Arc::new(account.identity_keys().clone()),
        });

        let pickle = account.pickle().await;
        self.account.insert(ACCOUNT_KEY.encode(), serde_json::to_vec(&pickle)?)?;

        self.flush().await
    }

    async fn save_device_id(&self, device_id: &DeviceId) -> Result<()> {
        self.account.insert(DEVICE_ID_KEY.encode(), device_id.as_str().as_bytes())?;
        self.flush().await
    }

    async fn load_device_id(&self) -> Result<Option<DeviceId>> {
        Ok(self
            .account
            .get(DEVICE_ID_KEY.encode())?
            .map(|d| String::from_utf8_lossy(&d).into_owned().into()))
    }

    async fn set_device_announced(&self) -> Result<()> {
        self.account.insert(DEVICE_ANNOUNCED_KEY.encode(), [1u8].as_ref())?;
        self.flush().await
    }

    async fn is_device_announced(&self) -> Result<bool> {
        Ok(self.account.get(DEVICE_ANNOUNCED_KEY.encode())?.is_some())
    }

    async fn save_devices_for_user(
        &self,
        user_id: &UserId,
        devices: HashMap<DeviceId, Device>,
    ) -> Result<()> {
        self.save_device_map(user_id, &devices).await
    }

    async fn save_device(&self, device: Device) -> Result<()> {
        let mut map = self.load_device_map(device.user_id())?.unwrap_or_default();
        let user_id = device.user_id().clone();

        map.insert(device.device_id().clone(), device);
        self.save_device_map(&user_id, &map).await
    }

    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.load_device_map(user_id)?.and_then(|mut m| m.remove(device_id)))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<Option<UserDevices>> {
        Ok(self.load_device_map(user_id)?.map(UserDevices::new))
    }

    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()> {
        self.room_settings.insert(room_id.encode(), serde_json::to_vec(&algorithm)?)?;
        self.flush().await
    }

    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>> {
        self.room_settings
            .get(room_id.encode())?
            .map(|a| serde_json::from_slice(&a).map_err(CryptoStoreError::Serialization))
            .transpose()
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        if self.get_account_info().is_none() {
            return Err(CryptoStoreError::AccountUnset);
        }

        let mut batch = Batch::default();

        for session in sessions {
            let pickle = session.pickle().await;
            let key = (session.sender_key(), session.session_id()).encode();

            batch.insert(key, serde_json::to_vec(&pickle)?);
        }

        self.sessions.apply_batch(batch)?;
        self.flush().await?;

        for session in sessions {
            self.session_cache.add(session.clone()).await;
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        let account_info = self.get_account_info().ok_or(CryptoStoreError::AccountUnset)?;

        if self.session_cache.get(sender_key).is_none() {
            let mut sessions = Vec::new();

            for pickle in self.sessions.scan_prefix(sender_key.encode()) {
                let (_, pickle) = pickle?;
                let pickle: PickledSession = serde_json::from_slice(&pickle)?;

                sessions.push(Session::from_pickle(
                    self.provider.clone(),
                    account_info.user_id.clone(),
                    account_info.identity_keys.clone(),
                    pickle,
                ));
            }

            if sessions.is_empty() {
                return Ok(None);
            }

            self.session_cache.set_for_sender(sender_key, sessions);
        }

        Ok(self.session_cache.get(sender_key))
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool> {
        let key = (session.session_id(), session.sender_key()).encode();
        let pickle = session.pickle().await;

        let existing = self.inbound_group_sessions.insert(key, serde_json::to_vec(&pickle)?)?;
        self.flush().await?;

        self.group_session_cache.add(session);

        Ok(existing.is_none())
    }

    async fn get_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<Option<InboundGroupSession>> {
        if let Some(session) = self.group_session_cache.get(session_id, sender_key) {
            return Ok(Some(session));
        }

        let Some(pickle) = self.inbound_group_sessions.get((session_id, sender_key).encode())?
        else {
            return Ok(None);
        };

        let pickle: PickledInboundGroupSession = serde_json::from_slice(&pickle)?;
        let session = InboundGroupSession::from_pickle(self.provider.clone(), pickle);

        Ok(Some(self.group_session_cache.get_or_insert(session)))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        let mut sessions = Vec::new();

        for pickle in self.inbound_group_sessions.iter() {
            let (_, pickle) = pickle?;
            let pickle: PickledInboundGroupSession = serde_json::from_slice(&pickle)?;
            let session = InboundGroupSession::from_pickle(self.provider.clone(), pickle);

            sessions.push(self.group_session_cache.get_or_insert(session));
        }

        Ok(sessions)
    }

    async fn remove_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<()> {
        self.inbound_group_sessions.remove((session_id, sender_key).encode())?;
        self.flush().await?;

        let _ = self.group_session_cache.remove(session_id, sender_key);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::SledStore;
    use crate::{
        identities::device::testing::get_device,
        provider::CryptoProvider,
        ratchet::{Account, InboundGroupSession},
        store::{CryptoStore, CryptoStoreError},
        testing::TestProvider,
        types::RoomId,
    };

    async fn get_store(path: &std::path::Path) -> SledStore {
        SledStore::open(path, Arc::new(TestProvider::new())).await.unwrap()
    }

    #[tokio::test]
    async fn has_data_lifecycle() {
        let dir = tempdir().unwrap();

        assert!(!SledStore::has_data(dir.path()));

        let store = get_store(dir.path()).await;
        let account = Account::new(
            Arc::new(TestProvider::new()),
            &"@alice:example.org".into(),
            &"ALICEDEVICE".into(),
        );
        store.save_account(account).await.unwrap();
        drop(store);

        assert!(SledStore::has_data(dir.path()));

        // The data survives a close/reopen cycle.
        let store = get_store(dir.path()).await;
        assert!(store.load_account().await.unwrap().is_some());
        drop(store);

        SledStore::delete_store(dir.path()).await.unwrap();
        assert!(!SledStore::has_data(dir.path()));
    }

    #[tokio::test]
    async fn account_roundtrip() {
        let dir = tempdir().unwrap();
        let store = get_store(dir.path()).await;

        assert!(store.load_account().await.unwrap().is_none());

        let account = Account::new(
            Arc::new(TestProvider::new()),
            &"@alice:example.org".into(),
            &"ALICEDEVICE".into(),
        );
        account.mark_as_shared();
        store.save_account(account.clone()).await.unwrap();

        let restored = store.load_account().await.unwrap().unwrap();
        assert_eq!(account, restored);
        assert!(restored.shared());
    }

    #[tokio::test]
    async fn sessions_need_an_account() {
        let dir = tempdir().unwrap();
        let store = get_store(dir.path()).await;

        let result = store.get_sessions("some_key").await;
        assert!(matches!(result, Err(CryptoStoreError::AccountUnset)));
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let dir = tempdir().unwrap();
        let store = get_store(dir.path()).await;
        let provider = Arc::new(TestProvider::new());

        let alice = Account::new(provider.clone(), &"@alice:example.org".into(), &"ALICE".into());
        let bob = Account::new(provider, &"@bob:example.org".into(), &"BOB".into());

        store.save_account(alice.clone()).await.unwrap();

        let one_time_keys = bob.generate_one_time_keys(1).await.unwrap();
        let one_time_key = one_time_keys.values().next().unwrap().to_owned();
        let session = alice
            .create_outbound_session(bob.identity_keys().curve25519(), &one_time_key)
            .await
            .unwrap();

        store.save_sessions(&[session.clone()]).await.unwrap();

        let sessions = store.get_sessions(session.sender_key()).await.unwrap().unwrap();
        let sessions = sessions.lock().await;

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), session.session_id());
    }

    #[tokio::test]
    async fn inbound_group_session_roundtrip() {
        let dir = tempdir().unwrap();
        let store = get_store(dir.path()).await;
        let provider = Arc::new(TestProvider::new());
        let room_id: RoomId = "!test:localhost".into();

        let outbound = provider.create_group_session();
        let inbound = InboundGroupSession::new(
            provider,
            "sender_key",
            "signing_key",
            &room_id,
            &outbound.session_key,
        )
        .unwrap();

        assert!(store.save_inbound_group_session(inbound.clone()).await.unwrap());
        // Saving again replaces the existing record.
        assert!(!store.save_inbound_group_session(inbound.clone()).await.unwrap());

        let loaded = store
            .get_inbound_group_session(inbound.session_id(), "sender_key")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound, loaded);
        assert_eq!(loaded.room_id(), &room_id);

        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 1);

        store.remove_inbound_group_session(inbound.session_id(), "sender_key").await.unwrap();
        assert!(store
            .get_inbound_group_session(inbound.session_id(), "sender_key")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn device_storage_is_wholesale() {
        let dir = tempdir().unwrap();
        let store = get_store(dir.path()).await;
        let device = get_device();

        assert!(store.get_user_devices(device.user_id()).await.unwrap().is_none());

        store
            .save_devices_for_user(
                device.user_id(),
                [(device.device_id().clone(), device.clone())].into(),
            )
            .await
            .unwrap();

        let loaded =
            store.get_device(device.user_id(), device.device_id()).await.unwrap().unwrap();
        assert_eq!(device, loaded);

        // A refresh that no longer reports the device drops it.
        store.save_devices_for_user(device.user_id(), Default::default()).await.unwrap();
        let devices = store.get_user_devices(device.user_id()).await.unwrap().unwrap();
        assert!(devices.is_empty());
    }
}
