//! Stress test: key generation and registration from many tasks at once.

#[path = "../support/mod.rs"]
mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use fleet_identity::crypto::keys::{parse_ssh_authorized_key, KeyMaterial, KeyType};
use fleet_identity::{DestinationSpec, JoinToken, MemoryStore, Registrar};

use support::{FakeAuthority, FakeTransport};

#[test]
fn stress_parallel_keygen_is_unique() {
    let handles: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(|| {
                (0..50)
                    .map(|_| KeyMaterial::generate(KeyType::default()).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for keys in handle.join().unwrap() {
            parse_ssh_authorized_key(keys.ssh_public_key()).unwrap();
            assert!(
                seen.insert(keys.ssh_public_key().to_string()),
                "duplicate key generated"
            );
        }
    }
    assert_eq!(seen.len(), 400);
}

#[test]
fn stress_reload_matches_generated() {
    for i in 0..200 {
        let keys = KeyMaterial::generate(KeyType::default()).unwrap();
        let reloaded = KeyMaterial::from_private_key_pem(keys.private_key_pem()).unwrap();
        assert_eq!(reloaded, keys, "reload {i} differs");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_concurrent_registrations() {
    let authority = FakeAuthority::new();
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let token = format!("tok-fleet-{i:04}");
            authority.add_token(&token);
            let transport = FakeTransport::new(&authority);
            tokio::spawn(async move {
                let config = support::config(DestinationSpec::Memory)
                    .with_token(JoinToken::new(token));
                let mut registrar =
                    Registrar::new(&config, Arc::new(MemoryStore::new()), transport);
                registrar.bootstrap().await.unwrap()
            })
        })
        .collect();

    let mut host_ids = HashSet::new();
    let mut keys = HashSet::new();
    for task in tasks {
        let identity = task.await.unwrap();
        identity.validate().unwrap();
        host_ids.insert(identity.id.host_uuid.clone());
        keys.insert(identity.ssh_public_key().to_string());
    }

    assert_eq!(host_ids.len(), 32);
    assert_eq!(keys.len(), 32);
    assert_eq!(authority.state.lock().unwrap().registered.len(), 32);
}
