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

//! The requests the machine asks the caller to send, and the responses it
//! expects back.
//!
//! The machine never performs network I/O. It hands out request values, the
//! caller sends them with whatever transport it has, and feeds the response
//! into the matching `receive_*` method. Dropping a request before its
//! response is received cancels the operation; no crypto state is touched
//! until the response arrives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DeviceId, DeviceKeyAlgorithm, EventEncryptionAlgorithm, UserId};

/// The public keys of a device, as uploaded to and downloaded from the
/// server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The user that owns the device.
    pub user_id: UserId,
    /// The unique id of the device.
    pub device_id: DeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// The public identity keys of the device.
    pub keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The human readable name of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Request to upload our device keys and fresh one-time keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The device keys, present only if they haven't been uploaded yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// A map from key id to one-time key.
    pub one_time_keys: BTreeMap<String, String>,
}

/// The response to a [`KeysUploadRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// How many one-time keys the server now holds for us.
    pub one_time_key_count: u64,
}

/// Request to download the device keys of the given users.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users whose device lists should be fetched.
    pub users: Vec<UserId>,
}

/// The response to a [`KeysQueryRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// A map from user id to the devices the server knows about for that
    /// user. A user that is present with an empty map has zero devices.
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
}

/// Request to claim one one-time key per listed device, so pairwise sessions
/// can be established with them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The devices a one-time key should be claimed for.
    pub one_time_keys: BTreeMap<UserId, Vec<DeviceId>>,
}

/// The response to a [`KeysClaimRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed one-time keys, one per device. Devices without spare
    /// one-time keys are missing from the map.
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, String>>,
}

/// Request to send a to-device event to a set of devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the event.
    pub event_type: String,
    /// A unique transaction id, used to match the request with its response.
    pub txn_id: String,
    /// A map from user id and device id to the event content meant for that
    /// device.
    pub messages: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
}
