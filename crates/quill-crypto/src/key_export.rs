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

//! Passphrase based authenticated encryption for room key export files.
//!
//! The export blob is the one externally interoperable format this crate
//! produces. Layout:
//!
//! ```text
//! version (u8) ‖ salt (16) ‖ iv (16) ‖ rounds (u32 BE) ‖ ciphertext ‖ mac (32)
//! ```
//!
//! The MAC covers everything preceding it and is verified before a single
//! ciphertext byte is trusted; decryption fails closed.

use std::io::{Cursor, Read};

use aes::{
    cipher::{generic_array::GenericArray, IvSizeUser, KeyIvInit, KeySizeUser, StreamCipher},
    Aes256,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ctr::Ctr128BE;
use hmac::{digest::MacError, Hmac, Mac as _};
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ratchet::ExportedRoomKey;

const VERSION: u8 = 1;

const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_SIZE: usize = 32;
const HEADER_SIZE: usize = 1 + SALT_SIZE + IV_SIZE + 4;

type Aes256Ctr = Ctr128BE<Aes256>;
type Aes256Key = GenericArray<u8, <Aes256Ctr as KeySizeUser>::KeySize>;
type Aes256Iv = GenericArray<u8, <Aes256Ctr as IvSizeUser>::IvSize>;

/// Error representing a failure to import a room key export.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The export was created by a version of the format this crate doesn't
    /// understand.
    #[error("the version of the key export isn't supported, got {0}, expected {VERSION}")]
    UnsupportedVersion(u8),

    /// The MAC didn't verify: the passphrase is wrong or the export is
    /// corrupted. No byte of the ciphertext has been trusted.
    #[error("the MAC of the key export couldn't be verified, wrong passphrase or corrupted data")]
    InvalidMac,

    /// The export is too short to contain the fixed-size header and MAC.
    #[error("the key export is truncated")]
    Truncated,

    /// The decrypted export couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The decrypted export isn't valid UTF-8.
    #[error("the decrypted key export isn't valid UTF-8")]
    InvalidUtf8,
}

impl From<MacError> for KeyExportError {
    fn from(_: MacError) -> Self {
        KeyExportError::InvalidMac
    }
}

/// Keys for the AES-256-CTR + HMAC-SHA-256 combination the export format
/// uses, expanded from a passphrase with PBKDF2-SHA-512.
#[derive(Zeroize, ZeroizeOnDrop)]
struct ExportCipherKey {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl ExportCipherKey {
    fn from_passphrase(passphrase: &str, rounds: u32, salt: &[u8; SALT_SIZE]) -> Self {
        let mut expanded_keys = [0u8; KEY_SIZE * 2];

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt, rounds, &mut expanded_keys)
            .expect("HMAC can be initialized with any key size");

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded_keys[0..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded_keys[KEY_SIZE..]);

        expanded_keys.zeroize();

        Self { aes_key, mac_key }
    }

    fn apply_keystream(&self, data: &mut [u8], iv: &[u8; IV_SIZE]) {
        let key = Aes256Key::from_slice(self.aes_key.as_slice());
        let iv = Aes256Iv::from_slice(iv.as_slice());

        let mut cipher = Aes256Ctr::new(key, iv);
        cipher.apply_keystream(data);
    }

    fn mac(&self, message: &[u8]) -> [u8; MAC_SIZE] {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("HMAC can be initialized with any key size");
        hmac.update(message);

        hmac.finalize().into_bytes().into()
    }

    fn verify_mac(&self, message: &[u8], mac: &[u8; MAC_SIZE]) -> Result<(), MacError> {
        let mut hmac = Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("HMAC can be initialized with any key size");
        hmac.update(message);

        hmac.verify(GenericArray::from_slice(mac))
    }
}

/// Generate a random IV with bit 63 cleared, to sidestep differences between
/// AES-CTR implementations for counters crossing the 64-bit boundary.
fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    thread_rng().fill_bytes(&mut iv);

    let mut iv = u128::from_be_bytes(iv);
    iv &= !(1 << 63);
    iv.to_be_bytes()
}

/// Encrypt a list of room keys with the given passphrase.
///
/// # Arguments
///
/// * `keys` - The sessions that should end up in the export.
///
/// * `passphrase` - The passphrase the export is protected with.
///
/// * `rounds` - The number of PBKDF2 rounds used to expand the passphrase.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<Vec<u8>, KeyExportError> {
    let mut plaintext = serde_json::to_vec(keys)?;

    let mut salt = [0u8; SALT_SIZE];
    thread_rng().fill_bytes(&mut salt);
    let iv = generate_iv();

    let key = ExportCipherKey::from_passphrase(passphrase, rounds, &salt);
    key.apply_keystream(&mut plaintext, &iv);

    let mut blob = Vec::with_capacity(HEADER_SIZE + plaintext.len() + MAC_SIZE);
    blob.push(VERSION);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.write_u32::<BigEndian>(rounds).expect("writing to a Vec can't fail");
    blob.append(&mut plaintext);

    let mac = key.mac(&blob);
    blob.extend_from_slice(&mac);

    Ok(blob)
}

/// Decrypt a room key export that was encrypted with
/// [`encrypt_room_key_export`].
///
/// The MAC is verified before any decrypted byte is trusted; a wrong
/// passphrase or corrupted blob fails with [`KeyExportError::InvalidMac`]
/// and no keys are returned.
pub fn decrypt_room_key_export(
    blob: &[u8],
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    if blob.len() < HEADER_SIZE + MAC_SIZE {
        return Err(KeyExportError::Truncated);
    }

    let mut cursor = Cursor::new(blob);

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut mac = [0u8; MAC_SIZE];

    let version = cursor.read_u8().map_err(|_| KeyExportError::Truncated)?;

    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion(version));
    }

    cursor.read_exact(&mut salt).map_err(|_| KeyExportError::Truncated)?;
    cursor.read_exact(&mut iv).map_err(|_| KeyExportError::Truncated)?;
    let rounds = cursor.read_u32::<BigEndian>().map_err(|_| KeyExportError::Truncated)?;

    let mac_start = blob.len() - MAC_SIZE;
    mac.copy_from_slice(&blob[mac_start..]);

    let key = ExportCipherKey::from_passphrase(passphrase, rounds, &salt);
    key.verify_mac(&blob[..mac_start], &mac)?;

    let mut ciphertext = blob[HEADER_SIZE..mac_start].to_vec();
    key.apply_keystream(&mut ciphertext, &iv);

    let plaintext = String::from_utf8(ciphertext).map_err(|_| KeyExportError::InvalidUtf8)?;

    Ok(serde_json::from_str(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError, VERSION};
    use crate::{
        provider::ExportedSessionKey,
        ratchet::ExportedRoomKey,
        types::{DeviceKeyAlgorithm, EventEncryptionAlgorithm},
    };

    fn export_keys() -> Vec<ExportedRoomKey> {
        vec![ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::GroupV1,
            room_id: "!room:example.org".into(),
            sender_key: "sender_curve25519".to_owned(),
            session_id: "session_id".to_owned(),
            session_key: ExportedSessionKey("exported_session_key".to_owned()),
            sender_claimed_keys: BTreeMap::from([(
                DeviceKeyAlgorithm::Ed25519,
                "sender_ed25519".to_owned(),
            )]),
            forwarding_curve25519_key_chain: vec![],
        }]
    }

    #[test]
    fn roundtrip() {
        let keys = export_keys();

        let blob = encrypt_room_key_export(&keys, "passphrase", 10).unwrap();
        let decrypted = decrypt_room_key_export(&blob, "passphrase").unwrap();

        assert_eq!(decrypted.len(), 1);
        assert_eq!(decrypted[0].session_id, keys[0].session_id);
        assert_eq!(decrypted[0].session_key, keys[0].session_key);
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let blob = encrypt_room_key_export(&export_keys(), "passphrase", 10).unwrap();

        assert!(matches!(
            decrypt_room_key_export(&blob, "wrong"),
            Err(KeyExportError::InvalidMac)
        ));
    }

    #[test]
    fn unsupported_version() {
        let mut blob = encrypt_room_key_export(&export_keys(), "passphrase", 10).unwrap();
        blob[0] = VERSION + 1;

        assert!(matches!(
            decrypt_room_key_export(&blob, "passphrase"),
            Err(KeyExportError::UnsupportedVersion(v)) if v == VERSION + 1
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails_closed() {
        let mut blob = encrypt_room_key_export(&export_keys(), "passphrase", 10).unwrap();
        let middle = blob.len() / 2;
        blob[middle] ^= 0xff;

        assert!(matches!(
            decrypt_room_key_export(&blob, "passphrase"),
            Err(KeyExportError::InvalidMac)
        ));
    }

    #[test]
    fn truncated_blob() {
        assert!(matches!(
            decrypt_room_key_export(b"too short", "passphrase"),
            Err(KeyExportError::Truncated)
        ));
    }
}
