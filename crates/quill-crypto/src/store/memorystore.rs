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
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{
    caches::{DeviceStore, GroupSessionStore, SessionStore},
    CryptoStore, Result,
};
use crate::{
    identities::{Device, UserDevices},
    ratchet::{Account, InboundGroupSession, Session},
    types::{DeviceId, EventEncryptionAlgorithm, RoomId, UserId},
};

const DEVICE_ID_KEY: &str = "device_id";
const DEVICE_ANNOUNCED_KEY: &str = "device_announced";

/// An in-memory only store that will forget all the E2EE keys once it's
/// dropped.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    account: Arc<RwLock<Option<Account>>>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    devices: DeviceStore,
    room_algorithms: Arc<DashMap<RoomId, EventEncryptionAlgorithm>>,
    values: Arc<DashMap<String, String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            account: Arc::new(RwLock::new(None)),
            sessions: SessionStore::new(),
            inbound_group_sessions: GroupSessionStore::new(),
            devices: DeviceStore::new(),
            room_algorithms: Arc::new(DashMap::new()),
            values: Arc::new(DashMap::new()),
        }
    }
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        Ok(self.account.read().unwrap().clone())
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        *self.account.write().unwrap() = Some(account);
        Ok(())
    }

    async fn save_device_id(&self, device_id: &DeviceId) -> Result<()> {
        self.values.insert(DEVICE_ID_KEY.to_owned(), device_id.to_string());
        Ok(())
    }

    async fn load_device_id(&self) -> Result<Option<DeviceId>> {
        Ok(self.values.get(DEVICE_ID_KEY).map(|v| v.value().as_str().into()))
    }

    async fn set_device_announced(&self) -> Result<()> {
        self.values.insert(DEVICE_ANNOUNCED_KEY.to_owned(), "true".to_owned());
        Ok(())
    }

    async fn is_device_announced(&self) -> Result<bool> {
        Ok(self.values.contains_key(DEVICE_ANNOUNCED_KEY))
    }

    async fn save_devices_for_user(
        &self,
        user_id: &UserId,
        devices: HashMap<DeviceId, Device>,
    ) -> Result<()> {
        self.devices.set_for_user(user_id, devices);
        Ok(())
    }

    async fn save_device(&self, device: Device) -> Result<()> {
        self.devices.add(device);
        Ok(())
    }

    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.devices.get(user_id, device_id))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<Option<UserDevices>> {
        Ok(self.devices.user_devices(user_id))
    }

    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()> {
        self.room_algorithms.insert(room_id.clone(), algorithm);
        Ok(())
    }

    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>> {
        Ok(self.room_algorithms.get(room_id).map(|a| a.value().clone()))
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        for session in sessions {
            let _ = self.sessions.add(session.clone()).await;
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key))
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool> {
        Ok(self.inbound_group_sessions.add(session))
    }

    async fn get_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(session_id, sender_key))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get_all())
    }

    async fn remove_inbound_group_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<()> {
        let _ = self.inbound_group_sessions.remove(session_id, sender_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::MemoryStore;
    use crate::{
        identities::device::testing::get_device,
        provider::CryptoProvider,
        ratchet::{tests::get_account_and_session, InboundGroupSession},
        store::CryptoStore,
        testing::TestProvider,
        types::{EventEncryptionAlgorithm, RoomId},
    };

    #[tokio::test]
    async fn session_store() {
        let (account, session) = get_account_and_session().await;
        let store = MemoryStore::new();

        assert!(store.load_account().await.unwrap().is_none());
        store.save_account(account).await.unwrap();

        store.save_sessions(&[session.clone()]).await.unwrap();

        let sessions = store.get_sessions(session.sender_key()).await.unwrap().unwrap();
        let sessions = sessions.lock().await;

        let loaded_session = &sessions[0];

        assert_eq!(&session, loaded_session);
    }

    #[tokio::test]
    async fn group_session_store() {
        let provider = Arc::new(TestProvider::new());
        let room_id: RoomId = "!test:localhost".into();

        let outbound = provider.create_group_session();
        let inbound = InboundGroupSession::new(
            provider,
            "test_key",
            "test_signing_key",
            &room_id,
            &outbound.session_key,
        )
        .unwrap();

        let store = MemoryStore::new();
        assert!(store.save_inbound_group_session(inbound.clone()).await.unwrap());

        let loaded_session = store
            .get_inbound_group_session(inbound.session_id(), "test_key")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound, loaded_session);

        store.remove_inbound_group_session(inbound.session_id(), "test_key").await.unwrap();
        assert!(store
            .get_inbound_group_session(inbound.session_id(), "test_key")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn device_store() {
        let device = get_device();
        let store = MemoryStore::new();

        assert!(store.get_user_devices(device.user_id()).await.unwrap().is_none());

        store
            .save_devices_for_user(
                device.user_id(),
                [(device.device_id().clone(), device.clone())].into(),
            )
            .await
            .unwrap();

        let loaded_device =
            store.get_device(device.user_id(), device.device_id()).await.unwrap().unwrap();
        assert_eq!(device, loaded_device);

        let user_devices = store.get_user_devices(device.user_id()).await.unwrap().unwrap();
        assert_eq!(user_devices.len(), 1);

        // Wholesale replacement with an empty map is "fetched, zero devices".
        store.save_devices_for_user(device.user_id(), Default::default()).await.unwrap();
        let user_devices = store.get_user_devices(device.user_id()).await.unwrap().unwrap();
        assert!(user_devices.is_empty());
    }

    #[tokio::test]
    async fn scalar_values() {
        let store = MemoryStore::new();

        assert!(store.load_device_id().await.unwrap().is_none());
        store.save_device_id(&"DEVICEID".into()).await.unwrap();
        assert_eq!(store.load_device_id().await.unwrap().unwrap(), "DEVICEID");

        assert!(!store.is_device_announced().await.unwrap());
        store.set_device_announced().await.unwrap();
        assert!(store.is_device_announced().await.unwrap());

        let room_id: RoomId = "!room:example.org".into();
        assert!(store.get_room_algorithm(&room_id).await.unwrap().is_none());
        store.set_room_algorithm(&room_id, EventEncryptionAlgorithm::GroupV1).await.unwrap();
        assert_eq!(
            store.get_room_algorithm(&room_id).await.unwrap().unwrap(),
            EventEncryptionAlgorithm::GroupV1
        );
    }
}
