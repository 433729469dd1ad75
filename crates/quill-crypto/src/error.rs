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

use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::{
    provider::ProviderError,
    store::CryptoStoreError,
    types::{DeviceId, EventId, RoomId, UserId},
};

pub type PairwiseResult<T> = Result<T, PairwiseError>;
pub type GroupResult<T> = Result<T, GroupError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum PairwiseError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The ratchet primitive failed to complete the operation.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// Encryption failed because the device does not have a valid session
    /// with us.
    #[error("encryption failed because the device does not have a valid session with us")]
    MissingSession,

    /// A group session operation failed while handling a received room key.
    #[error(transparent)]
    Group(#[from] GroupError),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum GroupError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event. The caller may re-request the key from the sender.
    #[error("can't find the room key to decrypt the event")]
    MissingSession,

    /// Decryption succeeded at a message index that a different event already
    /// used in this timeline. Someone is replaying old ciphertext.
    #[error(
        "replay attack detected, the message index {message_index} of session \
         {session_id} was already used by event {known_event_id}"
    )]
    ReplayAttack {
        /// The event that was being decrypted.
        event_id: EventId,
        /// The event that consumed the message index first.
        known_event_id: EventId,
        /// The id of the group session the two events were encrypted with.
        session_id: String,
        /// The contested ratchet index.
        message_index: u32,
    },

    /// No outbound group session exists for the room, a room key needs to be
    /// created and shared first.
    #[error("no outbound group session has been shared for room {0}")]
    MissingOutboundSession(RoomId),

    /// The room has no encryption algorithm configured.
    #[error("encryption is not enabled in room {0}")]
    EncryptionNotEnabled(RoomId),

    /// The ratchet primitive failed to complete the operation.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// An encrypted room key export couldn't be created or imported.
    #[error(transparent)]
    Export(#[from] crate::key_export::KeyExportError),
}

/// Error that occurs when an encrypted event is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The encrypted message has been encrypted with an unsupported
    /// algorithm.
    #[error("the encrypted message has been encrypted with an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The decrypted payload isn't a JSON object.
    #[error("the decrypted payload isn't a JSON object")]
    NotAnObject,

    /// The encrypted message doesn't contain a ciphertext for our device.
    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the \
         encrypted message, got {0}, expected {1}"
    )]
    MismatchedSender(UserId, UserId),

    /// The keys bound into the plaintext don't match the keys of the device
    /// the message was sent to.
    #[error("the keys of the message don't match the keys of this device")]
    MismatchedKeys,

    /// The room id carried inside the room key doesn't match the room the
    /// event was received in.
    #[error(
        "the room id of the room key doesn't match the room id of the \
         decrypted event, expected {0}, got {1}"
    )]
    MismatchedRoom(RoomId, RoomId),
}

/// A known device re-announced itself with different identity keys.
///
/// This is never auto-resolved; the device record keeps its old keys until
/// the conflict is acted upon by the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("the identity keys of device {device_id} of user {user_id} changed unexpectedly")]
pub struct IdentityKeyConflict {
    /// The owner of the device.
    pub user_id: UserId,
    /// The device that changed its keys.
    pub device_id: DeviceId,
    /// The curve25519 key we have on record.
    pub old_key: Option<String>,
    /// The curve25519 key the server reported.
    pub new_key: Option<String>,
}
