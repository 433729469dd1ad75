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

//! Collection of small in-memory stores that can be used to cache ratchet
//! objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    identities::{Device, UserDevices},
    ratchet::{InboundGroupSession, Session},
    types::{DeviceId, UserId},
};

/// In-memory store for pairwise sessions, keyed by the remote device's
/// curve25519 key.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    entries: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
}

impl SessionStore {
    /// Create a new empty session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the store.
    ///
    /// Returns true if the session was added, false if the session was
    /// already in the store.
    pub async fn add(&self, session: Session) -> bool {
        let sessions_lock = self
            .entries
            .entry(session.sender_key().to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));

        let mut sessions = sessions_lock.lock().await;

        if !sessions.contains(&session) {
            sessions.push(session);
            true
        } else {
            false
        }
    }

    /// Get all the sessions that belong to the given device key.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.get(sender_key).map(|s| s.clone())
    }

    /// Replace the list of sessions belonging to the given device key.
    pub fn set_for_sender(&self, sender_key: &str, sessions: Vec<Session>) {
        self.entries.insert(sender_key.to_owned(), Arc::new(Mutex::new(sessions)));
    }
}

/// In-memory store that holds inbound group sessions, keyed by
/// (session id, sender key).
#[derive(Debug, Default, Clone)]
pub struct GroupSessionStore {
    entries: Arc<DashMap<String, HashMap<String, InboundGroupSession>>>,
}

impl GroupSessionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the store.
    ///
    /// Returns true if the session was added, false if a session with the
    /// same keys was already in the store and got replaced.
    pub fn add(&self, session: InboundGroupSession) -> bool {
        self.entries
            .entry(session.sender_key().to_owned())
            .or_default()
            .insert(session.session_id().to_owned(), session)
            .is_none()
    }

    /// Get the session with the given id that the given sender key sent us.
    pub fn get(&self, session_id: &str, sender_key: &str) -> Option<InboundGroupSession> {
        self.entries.get(sender_key).and_then(|m| m.get(session_id).cloned())
    }

    /// Insert the session unless one with the same keys is already cached,
    /// returning the canonical instance.
    ///
    /// Guarantees that concurrent loaders of the same session end up sharing
    /// one ratchet state.
    pub fn get_or_insert(&self, session: InboundGroupSession) -> InboundGroupSession {
        let mut sessions = self.entries.entry(session.sender_key().to_owned()).or_default();

        sessions.entry(session.session_id().to_owned()).or_insert(session).clone()
    }

    /// Remove the session with the given id and sender key.
    ///
    /// Returns the session if it was in the store.
    pub fn remove(&self, session_id: &str, sender_key: &str) -> Option<InboundGroupSession> {
        self.entries.get_mut(sender_key).and_then(|mut m| m.remove(session_id))
    }

    /// Get all the group sessions the store knows about.
    pub fn get_all(&self) -> Vec<InboundGroupSession> {
        self.entries
            .iter()
            .flat_map(|d| d.value().values().cloned().collect::<Vec<InboundGroupSession>>())
            .collect()
    }

    /// Get the number of sessions the store knows about.
    pub fn count(&self) -> usize {
        self.entries.iter().map(|d| d.value().len()).sum()
    }
}

/// In-memory store holding the devices of users.
///
/// A user that is present with an empty map has been fetched and owns zero
/// devices; a user that is absent has never been fetched.
#[derive(Clone, Debug, Default)]
pub struct DeviceStore {
    entries: Arc<DashMap<UserId, HashMap<DeviceId, Device>>>,
}

impl DeviceStore {
    /// Create a new empty device store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the store, creating the user's map if it doesn't
    /// exist yet.
    ///
    /// Returns true if the device wasn't in the store before.
    pub fn add(&self, device: Device) -> bool {
        self.entries
            .entry(device.user_id().clone())
            .or_default()
            .insert(device.device_id().clone(), device)
            .is_none()
    }

    /// Get the device with the given id belonging to the given user.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
        self.entries.get(user_id).and_then(|m| m.get(device_id).cloned())
    }

    /// Remove the device with the given id belonging to the given user.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
        self.entries.get_mut(user_id).and_then(|mut m| m.remove(device_id))
    }

    /// Replace the map of devices for the given user wholesale.
    pub fn set_for_user(&self, user_id: &UserId, devices: HashMap<DeviceId, Device>) {
        self.entries.insert(user_id.clone(), devices);
    }

    /// Get a read-only view over all devices of the given user, or `None` if
    /// the user's devices were never stored.
    pub fn user_devices(&self, user_id: &UserId) -> Option<UserDevices> {
        self.entries.get(user_id).map(|m| UserDevices::new(m.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::{DeviceStore, GroupSessionStore, SessionStore};
    use crate::{
        identities::device::testing::get_device,
        provider::CryptoProvider,
        ratchet::{tests::get_account_and_session, InboundGroupSession},
        testing::TestProvider,
        types::RoomId,
    };

    #[tokio::test]
    async fn session_store() {
        let (_, session) = get_account_and_session().await;

        let store = SessionStore::new();

        assert!(store.add(session.clone()).await);
        assert!(!store.add(session.clone()).await);

        let sessions = store.get(session.sender_key()).unwrap();
        let sessions = sessions.lock().await;

        let loaded_session = &sessions[0];

        assert_eq!(&session, loaded_session);
    }

    #[tokio::test]
    async fn session_store_bulk_storing() {
        let (_, session) = get_account_and_session().await;

        let store = SessionStore::new();
        store.set_for_sender(session.sender_key(), vec![session.clone()]);

        let sessions = store.get(session.sender_key()).unwrap();
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

        let store = GroupSessionStore::new();
        assert!(store.add(inbound.clone()));

        let loaded_session = store.get(inbound.session_id(), "test_key").unwrap();
        assert_eq!(inbound, loaded_session);
        assert_eq!(store.count(), 1);

        assert!(store.remove(inbound.session_id(), "test_key").is_some());
        assert!(store.get(inbound.session_id(), "test_key").is_none());
    }

    #[test]
    fn device_store() {
        let device = get_device();
        let store = DeviceStore::new();

        assert!(store.add(device.clone()));
        assert!(!store.add(device.clone()));

        let loaded_device = store.get(device.user_id(), device.device_id()).unwrap();
        assert_eq!(device, loaded_device);

        let user_devices = store.user_devices(device.user_id()).unwrap();
        assert_eq!(user_devices.keys().next().unwrap(), device.device_id());
        assert_eq!(user_devices.devices().next().unwrap(), &device);

        store.remove(device.user_id(), device.device_id());
        assert!(store.get(device.user_id(), device.device_id()).is_none());

        // The user stays fetched, now with zero devices.
        assert!(store.user_devices(device.user_id()).unwrap().is_empty());

        store.set_for_user(&"@fresh:example.org".into(), HashMap::new());
        assert!(store.user_devices(&"@fresh:example.org".into()).unwrap().is_empty());
        assert!(store.user_devices(&"@never:example.org".into()).is_none());
    }
}
