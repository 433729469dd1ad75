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

#![doc = include_str!("../README.md")]
#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

mod error;
mod events;
mod group_manager;
mod identities;
mod key_export;
mod machine;
pub mod provider;
pub mod ratchet;
mod requests;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod types;
mod utilities;

pub use error::{
    EventError, GroupError, GroupResult, IdentityKeyConflict, PairwiseError, PairwiseResult,
};
pub use events::{
    DecryptedEvent, EncryptedEvent, EncryptedEventContent, EncryptionInfo, PairwisePayload,
    RoomKeyContent, ToDeviceEncryptedContent, ToDeviceEvent, ENCRYPTED_EVENT_TYPE,
    ROOM_KEY_EVENT_TYPE,
};
pub use group_manager::RoomKeyImportResult;
pub use identities::{Device, DeviceChanges, LocalTrust, UserDevices};
pub use key_export::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError};
pub use machine::CryptoMachine;
pub use requests::{
    DeviceKeys, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse,
    KeysUploadRequest, KeysUploadResponse, ToDeviceRequest,
};
pub use types::{DeviceId, DeviceKeyAlgorithm, EventEncryptionAlgorithm, EventId, RoomId, UserId};
