use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use idvault_core::identity::{HOOK_IDENTITY_BOUND, HOOK_NEW_IDENTITY};
use idvault_core::{
    CreateOptions, IdentityContext, IdentityError, IdentityId, IdentitySeed, IdentityUpdate,
    KdfParams, NetworkBinding, NetworkConfig, NetworkError, NetworkHandle, Store, StoreOptions,
};
use tempfile::{tempdir, TempDir};

/// Never answers; only the caller's timeout ends the call.
struct StalledNetwork;

#[async_trait]
impl NetworkBinding for StalledNetwork {
    fn network(&self) -> &str {
        "stalled"
    }

    async fn resolve(&self, _seed: &IdentitySeed) -> Result<NetworkHandle, NetworkError> {
        std::future::pending().await
    }
}

struct RejectingNetwork;

#[async_trait]
impl NetworkBinding for RejectingNetwork {
    fn network(&self) -> &str {
        "rejecting"
    }

    async fn resolve(&self, _seed: &IdentitySeed) -> Result<NetworkHandle, NetworkError> {
        Err(NetworkError::RejectedByNetwork("bad key format".into()))
    }
}

/// Records every seed it sees and answers with a fixed address.
#[derive(Default)]
struct RecordingNetwork {
    seen: Mutex<Vec<IdentitySeed>>,
}

#[async_trait]
impl NetworkBinding for RecordingNetwork {
    fn network(&self) -> &str {
        "devnet"
    }

    async fn resolve(&self, seed: &IdentitySeed) -> Result<NetworkHandle, NetworkError> {
        self.seen.lock().unwrap().push(seed.clone());
        Ok(NetworkHandle {
            network: "devnet".into(),
            endpoint: Some("http://fake".into()),
            address: format!("dev:{}", seed.id),
            resolved_at: Utc::now(),
        })
    }
}

fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("store.bin")
}

fn unlocked_store(dir: &TempDir) -> Store {
    let store = Store::open_with(
        store_path(dir),
        StoreOptions {
            kdf: KdfParams::development(),
            autosave: true,
        },
    )
    .unwrap();
    store.unlock("pw1").unwrap();
    store
}

fn stalled_config() -> NetworkConfig {
    NetworkConfig::custom("stalled", "http://unused").with_timeout(Duration::from_millis(50))
}

#[tokio::test]
async fn timed_out_binding_leaves_no_record() {
    let dir = tempdir().unwrap();
    let store = unlocked_store(&dir);
    let mut ctx = IdentityContext::new(store.clone()).unwrap();
    ctx.register_binding(Arc::new(StalledNetwork));

    let before = std::fs::read(store_path(&dir)).unwrap();
    let err = ctx
        .create_identity(CreateOptions {
            username: Some("alice".into()),
            network_binding: Some(stalled_config()),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Network(NetworkError::Timeout(d)) if d == Duration::from_millis(50)
    ));

    assert!(ctx.list_identities().unwrap().is_empty());
    assert!(store.keys().unwrap().is_empty());
    assert!(!store.has_pending_changes());
    assert_eq!(std::fs::read(store_path(&dir)).unwrap(), before);

    let unknown = IdentityId::new();
    assert!(matches!(
        ctx.get_identity(unknown),
        Err(IdentityError::NotFound(id)) if id == unknown
    ));
}

#[tokio::test]
async fn rejected_binding_is_surfaced() {
    let dir = tempdir().unwrap();
    let mut ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
    ctx.register_binding(Arc::new(RejectingNetwork));

    let err = ctx
        .create_identity(CreateOptions {
            username: None,
            network_binding: Some(NetworkConfig::custom("rejecting", "http://unused")),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::Network(NetworkError::RejectedByNetwork(_))
    ));
    assert!(ctx.list_identities().unwrap().is_empty());
}

#[tokio::test]
async fn bound_identity_persists_across_restart() {
    let dir = tempdir().unwrap();
    let fake = Arc::new(RecordingNetwork::default());
    let id = {
        let mut ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
        ctx.register_binding(fake.clone());
        ctx.create_identity(CreateOptions {
            username: Some("alice".into()),
            network_binding: Some(NetworkConfig::devnet()),
        })
        .await
        .unwrap()
    };

    let seen = fake.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, id);

    let ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
    let identity = ctx.get_identity(id).unwrap();
    let handle = identity.network_binding.as_ref().unwrap();
    assert_eq!(handle.address, format!("dev:{id}"));
    assert_eq!(handle.network, "devnet");
    assert_eq!(identity.verifying_key().unwrap().to_bytes(), seen[0].public_key);
}

#[tokio::test]
async fn lazy_bind_of_local_identity() {
    let dir = tempdir().unwrap();
    let mut ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
    ctx.register_binding(Arc::new(RecordingNetwork::default()));
    ctx.register_binding(Arc::new(StalledNetwork));

    let id = ctx.create_identity(CreateOptions::default()).await.unwrap();
    assert!(!ctx.get_identity(id).unwrap().is_bound());

    let err = ctx.bind_identity(id, &stalled_config()).await.unwrap_err();
    assert!(matches!(err, IdentityError::Network(NetworkError::Timeout(_))));
    assert!(!ctx.get_identity(id).unwrap().is_bound());

    let handle = ctx.bind_identity(id, &NetworkConfig::devnet()).await.unwrap();
    assert_eq!(ctx.get_identity(id).unwrap().network_binding, Some(handle));

    let again = ctx.bind_identity(id, &NetworkConfig::devnet()).await.unwrap_err();
    assert!(matches!(again, IdentityError::AlreadyBound(bound, ref net) if bound == id && net == "devnet"));
}

#[tokio::test]
async fn local_network_binding_needs_no_adapter() {
    let dir = tempdir().unwrap();
    let ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
    let id = ctx
        .create_identity(CreateOptions {
            username: None,
            network_binding: Some(NetworkConfig::local()),
        })
        .await
        .unwrap();
    let handle = ctx.get_identity(id).unwrap().network_binding.unwrap();
    assert!(handle.address.starts_with("local:"));
    assert!(handle.endpoint.is_none());
}

#[tokio::test]
async fn update_list_and_remove() {
    let dir = tempdir().unwrap();
    let ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
    let first = ctx
        .create_identity(CreateOptions {
            username: Some("alice".into()),
            network_binding: None,
        })
        .await
        .unwrap();
    let second = ctx
        .create_identity(CreateOptions {
            username: Some("bob".into()),
            network_binding: None,
        })
        .await
        .unwrap();

    let updated = ctx
        .update_identity(
            first,
            IdentityUpdate {
                username: None,
                status_message: Some("away".into()),
            },
        )
        .unwrap();
    assert_eq!(updated.username.as_deref(), Some("alice"));
    assert_eq!(updated.status_message.as_deref(), Some("away"));
    assert!(updated.updated_at >= updated.created_at);

    let ids: Vec<_> = ctx.list_identities().unwrap().iter().map(|i| i.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first) && ids.contains(&second));

    ctx.remove_identity(first).unwrap();
    assert!(matches!(ctx.get_identity(first), Err(IdentityError::NotFound(_))));
    assert!(matches!(ctx.remove_identity(first), Err(IdentityError::NotFound(_))));
    assert_eq!(ctx.list_identities().unwrap().len(), 1);
}

#[tokio::test]
async fn hooks_fire_on_commit_only() {
    let dir = tempdir().unwrap();
    let mut ctx = IdentityContext::new(unlocked_store(&dir)).unwrap();
    ctx.register_binding(Arc::new(RejectingNetwork));
    ctx.register_binding(Arc::new(RecordingNetwork::default()));

    let created = Arc::new(AtomicUsize::new(0));
    let bound = Arc::new(AtomicUsize::new(0));
    let c = created.clone();
    ctx.subscribe(HOOK_NEW_IDENTITY, move |hook, data| {
        assert_eq!(hook.to_string(), "ACCOUNTS::NEW_IDENTITY");
        assert!(data["id"].is_string());
        c.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let b = bound.clone();
    ctx.subscribe(HOOK_IDENTITY_BOUND, move |_, data| {
        assert_eq!(data["network"], "devnet");
        b.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert!(ctx.subscribe("NOT_A_HOOK", |_, _| {}).is_err());

    let _ = ctx
        .create_identity(CreateOptions {
            username: None,
            network_binding: Some(NetworkConfig::custom("rejecting", "http://unused")),
        })
        .await;
    assert_eq!(created.load(Ordering::SeqCst), 0);

    let id = ctx.create_identity(CreateOptions::default()).await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);

    ctx.bind_identity(id, &NetworkConfig::devnet()).await.unwrap();
    assert_eq!(bound.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn context_shares_the_callers_store() {
    let dir = tempdir().unwrap();
    let store = unlocked_store(&dir);
    let ctx = IdentityContext::new(store.clone()).unwrap();
    let id = ctx.create_identity(CreateOptions::default()).await.unwrap();

    // the caller keeps using its own handle
    store.set("settings/theme", b"dark").unwrap();
    assert_eq!(store.keys_with_prefix("identity/").unwrap().len(), 1);
    assert!(ctx.get_identity(id).is_ok());

    store.lock().unwrap();
    assert!(matches!(ctx.get_identity(id), Err(IdentityError::StoreLocked)));
    store.unlock("pw1").unwrap();
    assert!(ctx.get_identity(id).is_ok());
}
