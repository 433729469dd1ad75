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

//! The capability interface for the double-ratchet primitives.
//!
//! This crate never implements the ratchet math itself. Key generation,
//! session establishment and the authenticated encryption of opaque payloads
//! are delegated to a [`CryptoProvider`] implementation, which operates on
//! serialized session state so that the state can be persisted by a
//! [`CryptoStore`] without the store knowing anything about its contents.
//!
//! [`CryptoStore`]: crate::store::CryptoStore

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Error returned by a [`CryptoProvider`] operation.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The ciphertext couldn't be authenticated or decrypted.
    #[error("the ciphertext couldn't be decrypted: {0}")]
    Decryption(String),

    /// The message was encrypted using a ratchet index the session doesn't
    /// know about, i.e. one that predates the point the key was received at.
    #[error("the message was encrypted using an unknown message index")]
    UnknownMessageIndex,

    /// The message belongs to a different session than the one it was
    /// decrypted with.
    #[error("the message doesn't belong to the given session")]
    MismatchedSession,

    /// The session key that should create a session is invalid.
    #[error("the session key is invalid: {0}")]
    InvalidSessionKey(String),

    /// The serialized session state couldn't be restored.
    #[error("the serialized session state is corrupted: {0}")]
    InvalidState(String),
}

/// The public identity keys of an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    curve25519: String,
    ed25519: String,
}

impl IdentityKeys {
    /// Create a new set of identity keys.
    pub fn new(curve25519: String, ed25519: String) -> Self {
        Self { curve25519, ed25519 }
    }

    /// The key-agreement key of the account.
    pub fn curve25519(&self) -> &str {
        &self.curve25519
    }

    /// The signing key of the account.
    pub fn ed25519(&self) -> &str {
        &self.ed25519
    }
}

macro_rules! opaque_state {
    (
        $(#[doc = $docs:literal])*
        $name:ident
    ) => {
        $(#[doc = $docs])*
        ///
        /// The contents are only meaningful to the provider that produced
        /// them.
        #[derive(Clone, Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an already serialized state string.
            pub fn new(state: impl Into<String>) -> Self {
                Self(state.into())
            }

            /// The serialized form of the state.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(state: String) -> Self {
                Self(state)
            }
        }
    };
}

opaque_state! {
    /// Serialized long-term account state owned by the provider.
    AccountState
}

opaque_state! {
    /// Serialized pairwise session state owned by the provider.
    SessionState
}

opaque_state! {
    /// Serialized group session state owned by the provider.
    GroupSessionState
}

/// The key material needed to create an inbound group session matching an
/// outbound one, at the outbound session's current ratchet index.
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct GroupSessionKey(pub String);

/// The key material of an inbound group session exported at a given ratchet
/// index, self-contained enough to recreate the session elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ExportedSessionKey(pub String);

/// An encrypted pairwise message.
///
/// Pre-key messages bootstrap the session on the receiving end, normal
/// messages require the session to already exist there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RatchetMessage {
    /// A message carrying the information needed to establish the session.
    PreKey(String),
    /// A message encrypted with an established session.
    Normal(String),
}

impl RatchetMessage {
    /// The ciphertext body of the message.
    pub fn ciphertext(&self) -> &str {
        match self {
            RatchetMessage::PreKey(c) => c,
            RatchetMessage::Normal(c) => c,
        }
    }
}

/// A freshly generated account.
#[derive(Debug)]
pub struct CreatedAccount {
    /// The serialized account state.
    pub state: AccountState,
    /// The public identity keys of the account.
    pub identity_keys: IdentityKeys,
}

/// A freshly established pairwise session.
#[derive(Debug)]
pub struct CreatedSession {
    /// The serialized session state.
    pub state: SessionState,
    /// The unique id of the session.
    pub session_id: String,
}

/// The result of creating a session from a received pre-key message.
#[derive(Debug)]
pub struct InboundSessionCreation {
    /// The established session.
    pub session: CreatedSession,
    /// The plaintext of the pre-key message that established the session.
    pub plaintext: String,
}

/// A freshly created outbound group session.
#[derive(Debug)]
pub struct CreatedGroupSession {
    /// The serialized outbound session state.
    pub state: GroupSessionState,
    /// The unique id of the session.
    pub session_id: String,
    /// The key material recipients need to decrypt messages of this session.
    pub session_key: GroupSessionKey,
}

/// A freshly created inbound group session.
#[derive(Debug)]
pub struct CreatedInboundGroupSession {
    /// The serialized inbound session state.
    pub state: GroupSessionState,
    /// The unique id of the session, shared with the outbound side.
    pub session_id: String,
    /// The first message index this session is able to decrypt.
    pub first_known_index: u32,
}

/// The double-ratchet primitive operations this crate builds on.
///
/// Implementations must be deterministic for group decryption: decrypting
/// the same ciphertext at the same ratchet index twice yields identical
/// plaintext, which the replay-guard relies on for idempotent re-decryption.
pub trait CryptoProvider: Send + Sync + std::fmt::Debug {
    /// Generate a fresh long-term identity.
    fn create_account(&self) -> CreatedAccount;

    /// Generate `count` one-time keys, returning a map from key id to key.
    ///
    /// The keys stay marked as unpublished until
    /// [`mark_keys_as_published`](Self::mark_keys_as_published) is called.
    fn generate_one_time_keys(
        &self,
        account: &mut AccountState,
        count: usize,
    ) -> ProviderResult<BTreeMap<String, String>>;

    /// Discard the unpublished one-time keys, they have been uploaded.
    fn mark_keys_as_published(&self, account: &mut AccountState) -> ProviderResult<()>;

    /// Establish an outbound session with the device owning the given
    /// identity key, using a one-time key it published.
    fn create_outbound_session(
        &self,
        account: &AccountState,
        their_identity_key: &str,
        their_one_time_key: &str,
    ) -> ProviderResult<CreatedSession>;

    /// Establish an inbound session from a received pre-key message,
    /// decrypting the message in the process.
    fn create_inbound_session(
        &self,
        account: &mut AccountState,
        their_identity_key: &str,
        message: &str,
    ) -> ProviderResult<InboundSessionCreation>;

    /// Check if the given pre-key message was encrypted for the given
    /// session.
    fn session_matches(
        &self,
        session: &mut SessionState,
        their_identity_key: &str,
        message: &str,
    ) -> ProviderResult<bool>;

    /// Encrypt a plaintext with the session, advancing its ratchet.
    fn session_encrypt(
        &self,
        session: &mut SessionState,
        plaintext: &str,
    ) -> ProviderResult<RatchetMessage>;

    /// Decrypt a message with the session, advancing its ratchet.
    fn session_decrypt(
        &self,
        session: &mut SessionState,
        message: &RatchetMessage,
    ) -> ProviderResult<String>;

    /// Create a new outbound group session.
    fn create_group_session(&self) -> CreatedGroupSession;

    /// Encrypt a plaintext with the outbound group session, returning the
    /// ciphertext and the message index that was used.
    fn group_encrypt(
        &self,
        session: &mut GroupSessionState,
        plaintext: &str,
    ) -> ProviderResult<(String, u32)>;

    /// Export the key material of the outbound group session at its current
    /// ratchet index.
    fn group_session_key(&self, session: &GroupSessionState) -> ProviderResult<GroupSessionKey>;

    /// Create an inbound group session from a directly received session key.
    fn create_inbound_group_session(
        &self,
        session_key: &GroupSessionKey,
    ) -> ProviderResult<CreatedInboundGroupSession>;

    /// Restore an inbound group session from previously exported key
    /// material.
    fn import_inbound_group_session(
        &self,
        session_key: &ExportedSessionKey,
    ) -> ProviderResult<CreatedInboundGroupSession>;

    /// Decrypt a group message, returning the plaintext and the message
    /// index it was encrypted at.
    fn group_decrypt(
        &self,
        session: &mut GroupSessionState,
        ciphertext: &str,
    ) -> ProviderResult<(String, u32)>;

    /// Export the inbound group session at the given ratchet index.
    ///
    /// Fails with [`ProviderError::UnknownMessageIndex`] if the session
    /// can't decrypt messages that far back.
    fn export_inbound_group_session(
        &self,
        session: &GroupSessionState,
        message_index: u32,
    ) -> ProviderResult<ExportedSessionKey>;
}
