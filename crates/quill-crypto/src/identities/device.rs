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
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, DeviceKeyAlgorithm, EventEncryptionAlgorithm, UserId};

/// The local trust a user assigned to a device's identity key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device has been blocked from receiving room keys.
    Blocked = 1,
    /// No trust decision has been made yet.
    #[default]
    Unset = 2,
}

impl From<u8> for LocalTrust {
    fn from(state: u8) -> Self {
        match state {
            0 => LocalTrust::Verified,
            1 => LocalTrust::Blocked,
            _ => LocalTrust::Unset,
        }
    }
}

/// A device represents an E2EE capable client of a user.
#[derive(Clone, Debug)]
pub struct Device {
    user_id: Arc<UserId>,
    device_id: Arc<DeviceId>,
    algorithms: Arc<Vec<EventEncryptionAlgorithm>>,
    keys: Arc<BTreeMap<DeviceKeyAlgorithm, String>>,
    display_name: Arc<Option<String>>,
    deleted: Arc<AtomicBool>,
    trust_state: Arc<AtomicU8>,
}

impl Device {
    /// Create a new device record.
    pub fn new(
        user_id: UserId,
        device_id: DeviceId,
        display_name: Option<String>,
        trust_state: LocalTrust,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<DeviceKeyAlgorithm, String>,
    ) -> Self {
        Device {
            user_id: Arc::new(user_id),
            device_id: Arc::new(device_id),
            display_name: Arc::new(display_name),
            trust_state: Arc::new(AtomicU8::new(trust_state as u8)),
            algorithms: Arc::new(algorithms),
            keys: Arc::new(keys),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// The key of the given algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.keys.get(&algorithm).map(|k| k.as_str())
    }

    /// A map containing all the device keys.
    pub fn keys(&self) -> &BTreeMap<DeviceKeyAlgorithm, String> {
        &self.keys
    }

    /// The encryption algorithms the device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.algorithms
    }

    /// The local trust assigned to this device.
    pub fn local_trust(&self) -> LocalTrust {
        self.trust_state.load(Ordering::Relaxed).into()
    }

    /// Has this device been verified by the user.
    pub fn is_verified(&self) -> bool {
        self.local_trust() == LocalTrust::Verified
    }

    /// Has this device been blocked from receiving room keys.
    pub fn is_blocked(&self) -> bool {
        self.local_trust() == LocalTrust::Blocked
    }

    /// Update the local trust.
    ///
    /// Crate internal: the public path is
    /// [`Store::set_device_verification`], which persists the new state
    /// before it becomes visible here.
    ///
    /// [`Store::set_device_verification`]: crate::store::Store::set_device_verification
    pub(crate) fn set_local_trust(&self, trust: LocalTrust) {
        self.trust_state.store(trust as u8, Ordering::Relaxed);
    }

    /// Has the device been deleted on the server.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_as_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed);
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id()
            && self.device_id() == other.device_id()
            && self.keys() == other.keys()
    }
}

#[derive(Serialize, Deserialize)]
struct DeviceData {
    user_id: UserId,
    device_id: DeviceId,
    algorithms: Vec<EventEncryptionAlgorithm>,
    keys: BTreeMap<DeviceKeyAlgorithm, String>,
    display_name: Option<String>,
    deleted: bool,
    trust_state: LocalTrust,
}

impl Serialize for Device {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DeviceData {
            user_id: (*self.user_id).clone(),
            device_id: (*self.device_id).clone(),
            algorithms: self.algorithms.to_vec(),
            keys: (*self.keys).clone(),
            display_name: (*self.display_name).clone(),
            deleted: self.is_deleted(),
            trust_state: self.local_trust(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = DeviceData::deserialize(deserializer)?;

        let device = Device::new(
            data.user_id,
            data.device_id,
            data.display_name,
            data.trust_state,
            data.algorithms,
            data.keys,
        );
        device.deleted.store(data.deleted, Ordering::Relaxed);

        Ok(device)
    }
}

/// A read-only view over all devices of a user.
#[derive(Clone, Debug, Default)]
pub struct UserDevices {
    pub(crate) inner: HashMap<DeviceId, Device>,
}

impl UserDevices {
    pub(crate) fn new(inner: HashMap<DeviceId, Device>) -> Self {
        Self { inner }
    }

    /// Get the device with the given id, if the user owns one.
    pub fn get(&self, device_id: &DeviceId) -> Option<&Device> {
        self.inner.get(device_id)
    }

    /// An iterator over the ids of the user's devices.
    pub fn keys(&self) -> impl Iterator<Item = &DeviceId> {
        self.inner.keys()
    }

    /// An iterator over the user's devices.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.inner.values()
    }

    /// The number of devices the user has.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Does the user have no devices.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(any(test, feature = "testing"))]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use super::{Device, LocalTrust};
    use crate::types::{DeviceKeyAlgorithm, EventEncryptionAlgorithm};

    /// A device record with fixed keys for tests.
    pub(crate) fn get_device() -> Device {
        let keys = BTreeMap::from([
            (DeviceKeyAlgorithm::Curve25519, "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4".to_owned()),
            (DeviceKeyAlgorithm::Ed25519, "nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM".to_owned()),
        ]);

        Device::new(
            "@alice:example.org".into(),
            "BNYQQWUMXO".into(),
            Some("Alice's mobile phone".to_owned()),
            LocalTrust::Unset,
            vec![EventEncryptionAlgorithm::RatchetV1, EventEncryptionAlgorithm::GroupV1],
            keys,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::get_device, LocalTrust};
    use crate::{types::DeviceKeyAlgorithm, utilities::json_convert};

    #[test]
    fn device_keys() {
        let device = get_device();

        assert!(device.get_key(DeviceKeyAlgorithm::Curve25519).is_some());
        assert!(device.get_key(DeviceKeyAlgorithm::Ed25519).is_some());
        assert_eq!(device.local_trust(), LocalTrust::Unset);
        assert!(!device.is_verified());
        assert!(!device.is_blocked());
    }

    #[test]
    fn device_serialization_roundtrip() {
        let device = get_device();
        device.set_local_trust(LocalTrust::Verified);

        let restored: super::Device = json_convert(&device).unwrap();

        assert_eq!(device, restored);
        assert_eq!(restored.local_trust(), LocalTrust::Verified);
    }
}
