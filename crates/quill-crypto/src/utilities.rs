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

use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(any(test, feature = "testing"))]
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Decode a base64 string without padding.
#[cfg(any(test, feature = "testing"))]
pub(crate) fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_NO_PAD.decode(input)
}

/// Encode bytes as base64 without padding.
#[cfg(any(test, feature = "testing"))]
pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Milliseconds since the unix epoch.
pub(crate) fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A short random alphanumeric token, used for transaction and session ids.
pub(crate) fn random_token(length: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(length).map(char::from).collect()
}

#[cfg(test)]
pub(crate) fn json_convert<T, U>(value: &T) -> serde_json::Result<U>
where
    T: serde::Serialize,
    U: serde::de::DeserializeOwned,
{
    let json = serde_json::to_string(value)?;
    serde_json::from_str(&json)
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, random_token};

    #[test]
    fn base64_roundtrip() {
        let bytes = b"it's a secret to everybody";
        assert_eq!(decode(encode(bytes)).unwrap(), bytes);
    }

    #[test]
    fn token_length() {
        assert_eq!(random_token(22).len(), 22);
        assert_ne!(random_token(22), random_token(22));
    }
}
