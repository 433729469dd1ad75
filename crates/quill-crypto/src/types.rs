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

//! Identifier newtypes and the algorithm enums used across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_identifier {
    (
        $(#[doc = $docs:literal])*
        $name:ident
    ) => {
        $(#[doc = $docs])*
        #[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from the given string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

opaque_identifier! {
    /// The unique id of a user account.
    UserId
}

opaque_identifier! {
    /// The unique id of a device belonging to a user.
    DeviceId
}

opaque_identifier! {
    /// The unique id of a room.
    RoomId
}

opaque_identifier! {
    /// The unique id of an event in a room timeline.
    EventId
}

/// The encryption algorithm configured for a room or carried by an encrypted
/// event.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum EventEncryptionAlgorithm {
    /// Pairwise double-ratchet encryption, used for device to device
    /// messages.
    RatchetV1,
    /// Group ratchet encryption, used for room messages.
    GroupV1,
    /// An algorithm this crate doesn't understand.
    Unsupported(String),
}

impl EventEncryptionAlgorithm {
    const RATCHET_V1: &'static str = "chat.quill.ratchet.v1";
    const GROUP_V1: &'static str = "chat.quill.group.v1";

    /// The wire name of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::RatchetV1 => Self::RATCHET_V1,
            Self::GroupV1 => Self::GROUP_V1,
            Self::Unsupported(a) => a,
        }
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(algorithm: &str) -> Self {
        match algorithm {
            Self::RATCHET_V1 => Self::RatchetV1,
            Self::GROUP_V1 => Self::GroupV1,
            a => Self::Unsupported(a.to_owned()),
        }
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let algorithm = String::deserialize(deserializer)?;
        Ok(algorithm.as_str().into())
    }
}

/// The algorithm a device key is meant for.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKeyAlgorithm {
    /// The long-term key-agreement key of a device.
    #[serde(rename = "curve25519")]
    Curve25519,
    /// The long-term signing key of a device.
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl fmt::Display for DeviceKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self {
            Self::Curve25519 => "curve25519",
            Self::Ed25519 => "ed25519",
        };

        f.write_str(algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceKeyAlgorithm, EventEncryptionAlgorithm, UserId};

    #[test]
    fn algorithm_serialization() {
        let algorithm = EventEncryptionAlgorithm::GroupV1;
        let json = serde_json::to_string(&algorithm).unwrap();

        assert_eq!(json, "\"chat.quill.group.v1\"");
        assert_eq!(serde_json::from_str::<EventEncryptionAlgorithm>(&json).unwrap(), algorithm);

        let unknown: EventEncryptionAlgorithm = "chat.example.unknown".into();
        assert_eq!(unknown, EventEncryptionAlgorithm::Unsupported("chat.example.unknown".into()));
    }

    #[test]
    fn identifier_equality() {
        let user: UserId = "@alice:example.org".into();

        assert_eq!(user, "@alice:example.org");
        assert_eq!(user.as_str(), "@alice:example.org");
    }

    #[test]
    fn device_key_algorithm_names() {
        assert_eq!(DeviceKeyAlgorithm::Curve25519.to_string(), "curve25519");
        assert_eq!(DeviceKeyAlgorithm::Ed25519.to_string(), "ed25519");
    }
}
