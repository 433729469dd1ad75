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

//! The ratchet-state wrapper objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

mod account;
mod group_sessions;
mod session;

pub use account::{Account, PickledAccount};
pub use group_sessions::{
    EncryptionSettings, ExportedRoomKey, InboundGroupSession, OutboundGroupSession,
    PickledInboundGroupSession,
};
pub use session::{PickledSession, Session};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::{
        provider::RatchetMessage,
        ratchet::{Account, InboundGroupSession, Session},
        testing::TestProvider,
        types::{DeviceId, RoomId, UserId},
    };

    fn alice_id() -> UserId {
        "@alice:example.org".into()
    }

    fn alice_device_id() -> DeviceId {
        "ALICEDEVICE".into()
    }

    fn bob_id() -> UserId {
        "@bob:example.org".into()
    }

    fn bob_device_id() -> DeviceId {
        "BOBDEVICE".into()
    }

    pub(crate) async fn get_account_and_session() -> (Account, Session) {
        let provider = Arc::new(TestProvider::new());
        let alice = Account::new(provider.clone(), &alice_id(), &alice_device_id());
        let bob = Account::new(provider, &bob_id(), &bob_device_id());

        let one_time_keys = bob.generate_one_time_keys(1).await.unwrap();
        let one_time_key = one_time_keys.values().next().unwrap().to_owned();
        let sender_key = bob.identity_keys().curve25519().to_owned();
        let session = alice.create_outbound_session(&sender_key, &one_time_key).await.unwrap();

        (alice, session)
    }

    #[test]
    fn account_creation() {
        let provider = Arc::new(TestProvider::new());
        let account = Account::new(provider, &alice_id(), &alice_device_id());
        let identity_keys = account.identity_keys();

        assert!(!account.shared());
        assert!(!identity_keys.ed25519().is_empty());
        assert!(!identity_keys.curve25519().is_empty());

        account.mark_as_shared();
        assert!(account.shared());
    }

    #[tokio::test]
    async fn one_time_keys_creation() {
        let provider = Arc::new(TestProvider::new());
        let account = Account::new(provider, &alice_id(), &alice_device_id());

        let one_time_keys = account.generate_one_time_keys(10).await.unwrap();
        assert_eq!(one_time_keys.len(), 10);

        account.mark_keys_as_published().await.unwrap();
    }

    #[tokio::test]
    async fn session_creation() {
        let provider = Arc::new(TestProvider::new());
        let alice = Account::new(provider.clone(), &alice_id(), &alice_device_id());
        let bob = Account::new(provider, &bob_id(), &bob_device_id());

        let one_time_keys = alice.generate_one_time_keys(1).await.unwrap();
        let one_time_key = one_time_keys.values().next().unwrap().to_owned();
        alice.mark_keys_as_published().await.unwrap();

        let alice_keys = alice.identity_keys().clone();
        let bob_session =
            bob.create_outbound_session(alice_keys.curve25519(), &one_time_key).await.unwrap();

        let plaintext = "Hello world";
        let message = bob_session.encrypt_helper(plaintext).await.unwrap();

        let prekey_body = match &message {
            RatchetMessage::PreKey(m) => m.clone(),
            RatchetMessage::Normal(_) => panic!("Incorrect message type"),
        };

        let bob_keys = bob.identity_keys().clone();
        let (alice_session, decrypted) =
            alice.create_inbound_session(bob_keys.curve25519(), &prekey_body).await.unwrap();

        assert_eq!(bob_session.session_id(), alice_session.session_id());
        assert_eq!(plaintext, decrypted);
    }

    #[tokio::test]
    async fn group_session_creation() {
        let provider = Arc::new(TestProvider::new());
        let alice = Account::new(provider, &alice_id(), &alice_device_id());
        let room_id: RoomId = "!test:localhost".into();

        let (outbound, inbound) =
            alice.create_group_session_pair(&room_id, Default::default()).await.unwrap();

        assert_eq!(outbound.session_id(), inbound.session_id());
        assert_eq!(0, inbound.first_known_index());

        let content =
            outbound.encrypt("m.room.message", json!({"body": "secret"})).await.unwrap();
        let (plaintext, index) = inbound.decrypt_helper(&content.ciphertext).await.unwrap();

        assert_eq!(index, 0);
        assert!(plaintext.contains("secret"));
    }

    #[tokio::test]
    async fn concurrent_session_use_is_serialized() {
        let (_, session) = get_account_and_session().await;

        let mut handles = Vec::new();

        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(
                async move { session.encrypt_helper("plaintext").await.unwrap() },
            ));
        }

        let mut counters = Vec::new();

        for handle in handles {
            let message = handle.await.unwrap();
            let body: serde_json::Value = serde_json::from_str(message.ciphertext()).unwrap();
            counters.push(body["ctr"].as_u64().unwrap());
        }

        counters.sort_unstable();
        counters.dedup();

        // No ratchet step was reused or lost by the concurrent writers.
        assert_eq!(counters.len(), 8);
    }

    #[tokio::test]
    async fn group_session_export() {
        let provider = Arc::new(TestProvider::new());
        let alice = Account::new(provider.clone(), &alice_id(), &alice_device_id());
        let room_id: RoomId = "!test:localhost".into();

        let (_, inbound) =
            alice.create_group_session_pair(&room_id, Default::default()).await.unwrap();

        let export = inbound.export().await.unwrap();
        let imported = InboundGroupSession::from_export(provider, &export).unwrap();

        assert_eq!(inbound.session_id(), imported.session_id());
        assert_eq!(inbound.first_known_index(), imported.first_known_index());
        assert!(imported.has_been_imported());
    }
}
