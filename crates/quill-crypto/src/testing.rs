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

//! A deterministic [`CryptoProvider`] double for tests.
//!
//! The provider implements the trait contract (session ids, message
//! indices, pre-key bootstrapping, exportability at arbitrary indices)
//! without any real ratchet math; the "ciphertext" is an XOR keystream
//! derived from a shared token. It exists so the store and machine logic
//! can be exercised without the external primitive library and must never
//! be used outside of tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    provider::{
        AccountState, CreatedAccount, CreatedGroupSession, CreatedInboundGroupSession,
        CreatedSession, CryptoProvider, ExportedSessionKey, GroupSessionKey, GroupSessionState,
        IdentityKeys, InboundSessionCreation, ProviderError, ProviderResult, RatchetMessage,
        SessionState,
    },
    utilities::{decode, encode, random_token},
};

#[derive(Serialize, Deserialize)]
struct MockAccount {
    curve25519: String,
    ed25519: String,
    one_time_keys: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct MockSession {
    session_id: String,
    secret: String,
    creator_identity: String,
    role: String,
    ratchet: u64,
}

#[derive(Serialize, Deserialize)]
struct MockGroupSession {
    session_id: String,
    key: String,
    #[serde(default)]
    ratchet: u32,
    #[serde(default)]
    first_known_index: u32,
}

#[derive(Serialize, Deserialize)]
struct MockSessionKey {
    session_id: String,
    key: String,
    index: u32,
}

#[derive(Serialize, Deserialize)]
struct PairwiseMessageBody {
    session_id: String,
    ctr: u64,
    payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creator_identity: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct GroupCiphertext {
    session_id: String,
    index: u32,
    payload: String,
}

fn invalid_state(e: serde_json::Error) -> ProviderError {
    ProviderError::InvalidState(e.to_string())
}

fn parse_account(state: &AccountState) -> ProviderResult<MockAccount> {
    serde_json::from_str(state.as_str()).map_err(invalid_state)
}

fn parse_session(state: &SessionState) -> ProviderResult<MockSession> {
    serde_json::from_str(state.as_str()).map_err(invalid_state)
}

fn parse_group(state: &GroupSessionState) -> ProviderResult<MockGroupSession> {
    serde_json::from_str(state.as_str()).map_err(invalid_state)
}

fn to_state<S: Serialize, T: From<String>>(value: &S) -> T {
    serde_json::to_string(value).expect("mock states always serialize").into()
}

/// XOR the data with a keystream derived from the shared token and the
/// message counter. Deterministic, so decrypting the same counter twice
/// yields identical plaintext.
fn apply_keystream(secret: &str, counter: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut block = 0u64;

    while out.len() < data.len() {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(counter.to_be_bytes());
        hasher.update(block.to_be_bytes());

        for byte in hasher.finalize() {
            if out.len() == data.len() {
                break;
            }
            out.push(data[out.len()] ^ byte);
        }

        block += 1;
    }

    out
}

/// The deterministic provider double.
#[derive(Debug, Default)]
pub struct TestProvider;

impl TestProvider {
    /// Create a new test provider.
    ///
    /// All state lives in the opaque state strings, so any two instances
    /// are interchangeable.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for TestProvider {
    fn create_account(&self) -> CreatedAccount {
        let account = MockAccount {
            curve25519: random_token(43),
            ed25519: random_token(43),
            one_time_keys: BTreeMap::new(),
        };

        CreatedAccount {
            identity_keys: IdentityKeys::new(
                account.curve25519.clone(),
                account.ed25519.clone(),
            ),
            state: to_state(&account),
        }
    }

    fn generate_one_time_keys(
        &self,
        account: &mut AccountState,
        count: usize,
    ) -> ProviderResult<BTreeMap<String, String>> {
        let mut parsed = parse_account(account)?;
        let mut fresh = BTreeMap::new();

        for _ in 0..count {
            fresh.insert(format!("otk_{}", random_token(8)), random_token(43));
        }

        parsed.one_time_keys.extend(fresh.clone());
        *account = to_state(&parsed);

        Ok(fresh)
    }

    fn mark_keys_as_published(&self, account: &mut AccountState) -> ProviderResult<()> {
        let mut parsed = parse_account(account)?;
        parsed.one_time_keys.clear();
        *account = to_state(&parsed);

        Ok(())
    }

    fn create_outbound_session(
        &self,
        account: &AccountState,
        _their_identity_key: &str,
        _their_one_time_key: &str,
    ) -> ProviderResult<CreatedSession> {
        let parsed = parse_account(account)?;

        let session = MockSession {
            session_id: random_token(22),
            secret: random_token(32),
            creator_identity: parsed.curve25519,
            role: "outbound".to_owned(),
            ratchet: 0,
        };

        Ok(CreatedSession { session_id: session.session_id.clone(), state: to_state(&session) })
    }

    fn create_inbound_session(
        &self,
        _account: &mut AccountState,
        their_identity_key: &str,
        message: &str,
    ) -> ProviderResult<InboundSessionCreation> {
        let body: PairwiseMessageBody =
            serde_json::from_str(message).map_err(|e| ProviderError::Decryption(e.to_string()))?;

        let secret = body
            .secret
            .ok_or_else(|| ProviderError::Decryption("not a pre-key message".to_owned()))?;
        let creator = body
            .creator_identity
            .ok_or_else(|| ProviderError::Decryption("not a pre-key message".to_owned()))?;

        if creator != their_identity_key {
            return Err(ProviderError::MismatchedSession);
        }

        let payload =
            decode(&body.payload).map_err(|e| ProviderError::Decryption(e.to_string()))?;
        let plaintext = apply_keystream(&secret, body.ctr, &payload);
        let plaintext = String::from_utf8(plaintext)
            .map_err(|e| ProviderError::Decryption(e.to_string()))?;

        let session = MockSession {
            session_id: body.session_id.clone(),
            secret,
            creator_identity: creator,
            role: "inbound".to_owned(),
            ratchet: 0,
        };

        Ok(InboundSessionCreation {
            session: CreatedSession {
                session_id: body.session_id,
                state: to_state(&session),
            },
            plaintext,
        })
    }

    fn session_matches(
        &self,
        session: &mut SessionState,
        _their_identity_key: &str,
        message: &str,
    ) -> ProviderResult<bool> {
        let parsed = parse_session(session)?;
        let body: PairwiseMessageBody =
            serde_json::from_str(message).map_err(|e| ProviderError::Decryption(e.to_string()))?;

        Ok(body.session_id == parsed.session_id)
    }

    fn session_encrypt(
        &self,
        session: &mut SessionState,
        plaintext: &str,
    ) -> ProviderResult<RatchetMessage> {
        let mut parsed = parse_session(session)?;

        let ctr = parsed.ratchet;
        parsed.ratchet += 1;

        let payload = encode(apply_keystream(&parsed.secret, ctr, plaintext.as_bytes()));

        let message = if parsed.role == "outbound" {
            let body = PairwiseMessageBody {
                session_id: parsed.session_id.clone(),
                ctr,
                payload,
                secret: Some(parsed.secret.clone()),
                creator_identity: Some(parsed.creator_identity.clone()),
            };
            RatchetMessage::PreKey(serde_json::to_string(&body).map_err(invalid_state)?)
        } else {
            let body = PairwiseMessageBody {
                session_id: parsed.session_id.clone(),
                ctr,
                payload,
                secret: None,
                creator_identity: None,
            };
            RatchetMessage::Normal(serde_json::to_string(&body).map_err(invalid_state)?)
        };

        *session = to_state(&parsed);

        Ok(message)
    }

    fn session_decrypt(
        &self,
        session: &mut SessionState,
        message: &RatchetMessage,
    ) -> ProviderResult<String> {
        let parsed = parse_session(session)?;
        let body: PairwiseMessageBody = serde_json::from_str(message.ciphertext())
            .map_err(|e| ProviderError::Decryption(e.to_string()))?;

        if body.session_id != parsed.session_id {
            return Err(ProviderError::MismatchedSession);
        }

        let payload =
            decode(&body.payload).map_err(|e| ProviderError::Decryption(e.to_string()))?;
        let plaintext = apply_keystream(&parsed.secret, body.ctr, &payload);

        String::from_utf8(plaintext).map_err(|e| ProviderError::Decryption(e.to_string()))
    }

    fn create_group_session(&self) -> CreatedGroupSession {
        let session = MockGroupSession {
            session_id: random_token(22),
            key: random_token(32),
            ratchet: 0,
            first_known_index: 0,
        };

        let session_key = MockSessionKey {
            session_id: session.session_id.clone(),
            key: session.key.clone(),
            index: 0,
        };

        CreatedGroupSession {
            session_id: session.session_id.clone(),
            session_key: GroupSessionKey(
                serde_json::to_string(&session_key).expect("mock keys always serialize"),
            ),
            state: to_state(&session),
        }
    }

    fn group_encrypt(
        &self,
        session: &mut GroupSessionState,
        plaintext: &str,
    ) -> ProviderResult<(String, u32)> {
        let mut parsed = parse_group(session)?;

        let index = parsed.ratchet;
        parsed.ratchet += 1;

        let ciphertext = GroupCiphertext {
            session_id: parsed.session_id.clone(),
            index,
            payload: encode(apply_keystream(&parsed.key, index.into(), plaintext.as_bytes())),
        };

        *session = to_state(&parsed);

        Ok((serde_json::to_string(&ciphertext).map_err(invalid_state)?, index))
    }

    fn group_session_key(&self, session: &GroupSessionState) -> ProviderResult<GroupSessionKey> {
        let parsed = parse_group(session)?;

        let key = MockSessionKey {
            session_id: parsed.session_id,
            key: parsed.key,
            index: parsed.ratchet,
        };

        Ok(GroupSessionKey(serde_json::to_string(&key).map_err(invalid_state)?))
    }

    fn create_inbound_group_session(
        &self,
        session_key: &GroupSessionKey,
    ) -> ProviderResult<CreatedInboundGroupSession> {
        let key: MockSessionKey = serde_json::from_str(&session_key.0)
            .map_err(|e| ProviderError::InvalidSessionKey(e.to_string()))?;

        let session = MockGroupSession {
            session_id: key.session_id.clone(),
            key: key.key,
            ratchet: key.index,
            first_known_index: key.index,
        };

        Ok(CreatedInboundGroupSession {
            session_id: key.session_id,
            first_known_index: key.index,
            state: to_state(&session),
        })
    }

    fn import_inbound_group_session(
        &self,
        session_key: &ExportedSessionKey,
    ) -> ProviderResult<CreatedInboundGroupSession> {
        self.create_inbound_group_session(&GroupSessionKey(session_key.0.clone()))
    }

    fn group_decrypt(
        &self,
        session: &mut GroupSessionState,
        ciphertext: &str,
    ) -> ProviderResult<(String, u32)> {
        let parsed = parse_group(session)?;
        let message: GroupCiphertext = serde_json::from_str(ciphertext)
            .map_err(|e| ProviderError::Decryption(e.to_string()))?;

        if message.session_id != parsed.session_id {
            return Err(ProviderError::MismatchedSession);
        }

        if message.index < parsed.first_known_index {
            return Err(ProviderError::UnknownMessageIndex);
        }

        let payload =
            decode(&message.payload).map_err(|e| ProviderError::Decryption(e.to_string()))?;
        let plaintext = apply_keystream(&parsed.key, message.index.into(), &payload);
        let plaintext = String::from_utf8(plaintext)
            .map_err(|e| ProviderError::Decryption(e.to_string()))?;

        Ok((plaintext, message.index))
    }

    fn export_inbound_group_session(
        &self,
        session: &GroupSessionState,
        message_index: u32,
    ) -> ProviderResult<ExportedSessionKey> {
        let parsed = parse_group(session)?;

        if message_index < parsed.first_known_index {
            return Err(ProviderError::UnknownMessageIndex);
        }

        let key = MockSessionKey {
            session_id: parsed.session_id,
            key: parsed.key,
            index: message_index,
        };

        Ok(ExportedSessionKey(serde_json::to_string(&key).map_err(invalid_state)?))
    }
}

#[cfg(test)]
mod tests {
    use super::TestProvider;
    use crate::provider::CryptoProvider;

    #[test]
    fn pairwise_bootstrap() {
        let provider = TestProvider::new();

        let alice = provider.create_account();
        let mut bob = provider.create_account();

        let mut session = provider
            .create_outbound_session(&alice.state, bob.identity_keys.curve25519(), "otk")
            .unwrap();

        let message = provider.session_encrypt(&mut session.state, "hello").unwrap();

        let creation = provider
            .create_inbound_session(
                &mut bob.state,
                alice.identity_keys.curve25519(),
                message.ciphertext(),
            )
            .unwrap();

        assert_eq!(creation.plaintext, "hello");
        assert_eq!(creation.session.session_id, session.session_id);
    }

    #[test]
    fn group_indices_are_deterministic() {
        let provider = TestProvider::new();

        let mut outbound = provider.create_group_session();
        let inbound = provider.create_inbound_group_session(&outbound.session_key).unwrap();

        let (ciphertext, index) = provider.group_encrypt(&mut outbound.state, "secret").unwrap();
        assert_eq!(index, 0);

        let mut state = inbound.state.clone();
        let (first, _) = provider.group_decrypt(&mut state, &ciphertext).unwrap();
        let (second, _) = provider.group_decrypt(&mut state, &ciphertext).unwrap();

        assert_eq!(first, "secret");
        assert_eq!(first, second);
    }

    #[test]
    fn staler_export_is_rejected() {
        let provider = TestProvider::new();

        let mut outbound = provider.create_group_session();
        let _ = provider.group_encrypt(&mut outbound.state, "one").unwrap();
        let _ = provider.group_encrypt(&mut outbound.state, "two").unwrap();

        // An inbound session created from the current key only knows indices
        // from 2 onwards.
        let key = provider.group_session_key(&outbound.state).unwrap();
        let inbound = provider.create_inbound_group_session(&key).unwrap();
        assert_eq!(inbound.first_known_index, 2);

        let mut state = inbound.state;
        assert!(provider.export_inbound_group_session(&state, 1).is_err());

        let (old_ciphertext, _) = {
            let mut fresh = provider.create_group_session();
            provider.group_encrypt(&mut fresh.state, "other").unwrap()
        };
        assert!(provider.group_decrypt(&mut state, &old_ciphertext).is_err());
    }
}
