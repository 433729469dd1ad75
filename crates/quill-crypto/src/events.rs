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

//! The encrypted event payloads the machine consumes and produces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    provider::{GroupSessionKey, RatchetMessage},
    types::{DeviceId, DeviceKeyAlgorithm, EventEncryptionAlgorithm, EventId, RoomId, UserId},
};

/// The event type of an encrypted room or to-device event.
pub const ENCRYPTED_EVENT_TYPE: &str = "chat.quill.encrypted";

/// The event type of a room key to-device message.
pub const ROOM_KEY_EVENT_TYPE: &str = "chat.quill.room_key";

/// The content of an encrypted room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEventContent {
    /// The algorithm the content was encrypted with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The curve25519 key of the device that encrypted the content.
    pub sender_key: String,
    /// The id of the device that encrypted the content.
    pub device_id: DeviceId,
    /// The id of the group session that was used to encrypt the content.
    pub session_id: String,
    /// The ciphertext.
    pub ciphertext: String,
}

/// An encrypted event of a room timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The unique id of the event.
    pub event_id: EventId,
    /// The user that sent the event.
    pub sender: UserId,
    /// The room the event was sent in.
    pub room_id: RoomId,
    /// The encrypted content.
    pub content: EncryptedEventContent,
}

/// The content of an encrypted to-device event, one ciphertext per recipient
/// device key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEncryptedContent {
    /// The algorithm the content was encrypted with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The curve25519 key of the device that encrypted the content.
    pub sender_key: String,
    /// A map from the recipient's curve25519 key to the message meant for
    /// that device.
    pub ciphertext: BTreeMap<String, RatchetMessage>,
}

/// A to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent the event.
    pub sender: UserId,
    /// The content of the event.
    pub content: C,
}

/// The plaintext content of a room key to-device message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the room key is meant for.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the key belongs to.
    pub room_id: RoomId,
    /// The unique id of the group session.
    pub session_id: String,
    /// The key material of the group session.
    pub session_key: GroupSessionKey,
}

/// The plaintext carried inside a pairwise message.
///
/// The sender and recipient identities are bound into the plaintext so a
/// message can't be silently re-attributed to another device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairwisePayload {
    /// The user that encrypted the message.
    pub sender: UserId,
    /// The user the message was encrypted for.
    pub recipient: UserId,
    /// The signing keys of the sender.
    pub keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The signing keys of the recipient.
    pub recipient_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The type of the encrypted event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the encrypted event.
    pub content: Value,
}

/// Metadata about how an event was encrypted, attached to every successful
/// decryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// The user that the encryption claims as the sender.
    pub sender: UserId,
    /// The curve25519 key of the device that encrypted the event.
    pub sender_curve25519_key: String,
    /// The ed25519 key the sender claimed when the session was received.
    ///
    /// Claimed, because nothing proves the key belongs to the sender unless
    /// the device has been verified.
    pub claimed_ed25519_key: Option<String>,
    /// The chain of curve25519 keys the session was forwarded through, empty
    /// if we received the session directly.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// A successfully decrypted room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedEvent {
    /// The type of the decrypted event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The decrypted content.
    pub content: Value,
    /// Metadata about the encryption of the event.
    pub encryption_info: EncryptionInfo,
}

/// The plaintext a group message ciphertext decrypts to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct GroupMessagePayload {
    /// The room the message claims to belong to.
    pub room_id: RoomId,
    /// The type of the encrypted event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the encrypted event.
    pub content: Value,
}
