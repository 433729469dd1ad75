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

use tracing::{info, warn};

use super::Device;
use crate::{
    error::IdentityKeyConflict,
    requests::{DeviceKeys, KeysQueryResponse},
    store::{Result as StoreResult, Store},
    types::{DeviceId, DeviceKeyAlgorithm, UserId},
};

/// The device list changes a key query produced.
#[derive(Debug, Default)]
pub struct DeviceChanges {
    /// Devices we saw for the first time.
    pub new: Vec<Device>,
    /// Devices we already knew about, re-announced with unchanged identity
    /// keys.
    pub changed: Vec<Device>,
    /// Known devices that re-announced themselves with *different* identity
    /// keys. The old records are kept; each conflict is surfaced here and
    /// must be resolved by the user, never automatically.
    pub conflicts: Vec<IdentityKeyConflict>,
}

/// Keeps the store's device records in sync with downloaded device lists.
#[derive(Debug, Clone)]
pub(crate) struct IdentityManager {
    user_id: Arc<UserId>,
    device_id: Arc<DeviceId>,
    store: Store,
}

impl IdentityManager {
    pub(crate) fn new(user_id: Arc<UserId>, device_id: Arc<DeviceId>, store: Store) -> Self {
        Self { user_id, device_id, store }
    }

    /// Process the response of a key query, updating the stored device lists.
    ///
    /// The device map of every user in the response is replaced wholesale,
    /// carrying the local trust of still-reported devices forward. A device
    /// missing from the refresh loses its record including any verification
    /// state; a known risk inherited from the upstream behavior.
    pub(crate) async fn receive_keys_query_response(
        &self,
        response: &KeysQueryResponse,
    ) -> StoreResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();

        for (user_id, device_map) in &response.device_keys {
            let existing = self.store.get_user_devices(user_id).await?;
            let mut new_map: HashMap<DeviceId, Device> = HashMap::new();

            for (device_id, device_keys) in device_map {
                if self.own_device(user_id, device_id) {
                    continue;
                }

                if &device_keys.user_id != user_id || &device_keys.device_id != device_id {
                    warn!(
                        %user_id, %device_id,
                        "Ignoring device keys with mismatched identifiers"
                    );
                    continue;
                }

                let old = existing.as_ref().and_then(|d| d.get(device_id));

                match old {
                    Some(old) if self.keys_changed(old, device_keys) => {
                        warn!(
                            %user_id, %device_id,
                            "The device re-announced itself with different identity keys"
                        );

                        changes.conflicts.push(IdentityKeyConflict {
                            user_id: user_id.clone(),
                            device_id: device_id.clone(),
                            old_key: old
                                .get_key(DeviceKeyAlgorithm::Curve25519)
                                .map(|k| k.to_owned()),
                            new_key: device_keys
                                .keys
                                .get(&DeviceKeyAlgorithm::Curve25519)
                                .cloned(),
                        });

                        // Keep the record we trusted, don't adopt the new keys.
                        new_map.insert(device_id.clone(), old.clone());
                    }
                    Some(old) => {
                        let device = device_from_keys(device_keys, old.local_trust());
                        new_map.insert(device_id.clone(), device.clone());
                        changes.changed.push(device);
                    }
                    None => {
                        let device = device_from_keys(device_keys, Default::default());
                        new_map.insert(device_id.clone(), device.clone());
                        changes.new.push(device);
                    }
                }
            }

            self.store.save_devices_for_user(user_id, new_map).await?;
        }

        info!(
            new = changes.new.len(),
            changed = changes.changed.len(),
            conflicts = changes.conflicts.len(),
            "Processed a key query response"
        );

        Ok(changes)
    }

    fn own_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        *self.user_id == *user_id && *self.device_id == *device_id
    }

    fn keys_changed(&self, old: &Device, new: &DeviceKeys) -> bool {
        let curve_changed = old.get_key(DeviceKeyAlgorithm::Curve25519)
            != new.keys.get(&DeviceKeyAlgorithm::Curve25519).map(|k| k.as_str());
        let ed_changed = old.get_key(DeviceKeyAlgorithm::Ed25519)
            != new.keys.get(&DeviceKeyAlgorithm::Ed25519).map(|k| k.as_str());

        curve_changed || ed_changed
    }
}

fn device_from_keys(keys: &DeviceKeys, trust: crate::identities::LocalTrust) -> Device {
    Device::new(
        keys.user_id.clone(),
        keys.device_id.clone(),
        keys.display_name.clone(),
        trust,
        keys.algorithms.clone(),
        keys.keys.clone(),
    )
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use super::IdentityManager;
    use crate::{
        identities::LocalTrust,
        requests::{DeviceKeys, KeysQueryResponse},
        store::{MemoryStore, Store},
        types::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, UserId},
    };

    fn manager() -> IdentityManager {
        let store = Store::new(Arc::new(MemoryStore::new()));
        IdentityManager::new(
            Arc::new("@alice:example.org".into()),
            Arc::new("ALICEDEVICE".into()),
            store,
        )
    }

    fn bob_keys(curve: &str) -> DeviceKeys {
        DeviceKeys {
            user_id: "@bob:example.org".into(),
            device_id: "BOBDEVICE".into(),
            algorithms: vec![EventEncryptionAlgorithm::GroupV1],
            keys: BTreeMap::from([
                (DeviceKeyAlgorithm::Curve25519, curve.to_owned()),
                (DeviceKeyAlgorithm::Ed25519, "bob_ed25519".to_owned()),
            ]),
            display_name: None,
        }
    }

    fn response_with(keys: DeviceKeys) -> KeysQueryResponse {
        KeysQueryResponse {
            device_keys: BTreeMap::from([(
                keys.user_id.clone(),
                BTreeMap::from([(keys.device_id.clone(), keys)]),
            )]),
        }
    }

    #[tokio::test]
    async fn new_devices_are_stored() {
        let manager = manager();
        let bob: UserId = "@bob:example.org".into();

        let changes =
            manager.receive_keys_query_response(&response_with(bob_keys("curve_one"))).await.unwrap();

        assert_eq!(changes.new.len(), 1);
        assert!(changes.conflicts.is_empty());

        let device =
            manager.store.get_device(&bob, &"BOBDEVICE".into()).await.unwrap().unwrap();
        assert_eq!(device.get_key(DeviceKeyAlgorithm::Curve25519).unwrap(), "curve_one");
    }

    #[tokio::test]
    async fn changed_keys_are_a_conflict() {
        let manager = manager();
        let bob: UserId = "@bob:example.org".into();

        manager.receive_keys_query_response(&response_with(bob_keys("curve_one"))).await.unwrap();

        let changes =
            manager.receive_keys_query_response(&response_with(bob_keys("curve_two"))).await.unwrap();

        assert_eq!(changes.conflicts.len(), 1);
        assert_eq!(changes.conflicts[0].old_key.as_deref(), Some("curve_one"));
        assert_eq!(changes.conflicts[0].new_key.as_deref(), Some("curve_two"));

        // The stored record still carries the old key.
        let device =
            manager.store.get_device(&bob, &"BOBDEVICE".into()).await.unwrap().unwrap();
        assert_eq!(device.get_key(DeviceKeyAlgorithm::Curve25519).unwrap(), "curve_one");
    }

    #[tokio::test]
    async fn trust_is_carried_forward() {
        let manager = manager();
        let bob: UserId = "@bob:example.org".into();

        manager.receive_keys_query_response(&response_with(bob_keys("curve_one"))).await.unwrap();
        manager
            .store
            .set_device_verification(&bob, &"BOBDEVICE".into(), LocalTrust::Verified)
            .await
            .unwrap();

        let changes =
            manager.receive_keys_query_response(&response_with(bob_keys("curve_one"))).await.unwrap();
        assert_eq!(changes.changed.len(), 1);

        let device =
            manager.store.get_device(&bob, &"BOBDEVICE".into()).await.unwrap().unwrap();
        assert!(device.is_verified());
    }

    #[tokio::test]
    async fn absent_devices_are_dropped_wholesale() {
        let manager = manager();
        let bob: UserId = "@bob:example.org".into();

        manager.receive_keys_query_response(&response_with(bob_keys("curve_one"))).await.unwrap();

        // A refresh that reports zero devices for bob.
        let response = KeysQueryResponse {
            device_keys: BTreeMap::from([(bob.clone(), BTreeMap::new())]),
        };
        manager.receive_keys_query_response(&response).await.unwrap();

        let devices = manager.store.get_user_devices(&bob).await.unwrap().unwrap();
        assert!(devices.is_empty());
    }
}
