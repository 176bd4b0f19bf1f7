#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use fabrik_core::config::DirectorConfig;
use fabrik_core::{FabrikError, FabrikResult};
use fabrik_ops::{ConfigDocumentStore, ConfigLockManager, Director, DirectorCloudConfig, FakeDirector};
use tokio::sync::Semaphore;

fn manager() -> (Arc<FakeDirector>, Arc<ConfigLockManager>) {
    let director = Arc::new(FakeDirector::new(DirectorConfig::new("bosh", "https://director")));
    let store = Arc::new(DirectorCloudConfig::new(director.clone()));
    (director, Arc::new(ConfigLockManager::new(store)))
}

/// Reads block until the gate opens, so the first writer holds the lock meanwhile.
struct GatedStore {
    inner: DirectorCloudConfig,
    gate: Semaphore,
}

#[async_trait::async_trait]
impl ConfigDocumentStore for GatedStore {
    async fn read(&self, key: &str) -> FabrikResult<String> {
        let _open = self.gate.acquire().await.expect("gate");
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, document: &str) -> FabrikResult<()> { self.inner.write(key, document).await }
}

#[tokio::test]
async fn writers_run_in_fifo_order() {
    let director = Arc::new(FakeDirector::new(DirectorConfig::new("bosh", "https://director")));
    let store = Arc::new(GatedStore { inner: DirectorCloudConfig::new(director.clone()), gate: Semaphore::new(0) });
    let mgr = Arc::new(ConfigLockManager::new(store.clone()));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut writers = Vec::new();
    for i in 0..4 {
        let mgr = mgr.clone();
        let order = order.clone();
        writers.push(tokio::spawn(async move {
            mgr.with_lock("bosh", move |doc| {
                order.lock().unwrap().push(i);
                Ok((format!("{}{}", doc, i), ()))
            })
            .await
        }));
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }
    assert!(mgr.holder("bosh").is_some());
    assert_eq!(mgr.queued("bosh"), 3);

    store.gate.add_permits(1);
    for w in writers {
        w.await.expect("join").expect("writer");
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(director.get_config("cloud", "bosh").await.expect("config").as_deref(), Some("0123"));
    assert!(mgr.holder("bosh").is_none());
}

#[tokio::test]
async fn lost_token_is_forbidden_and_nothing_is_written() {
    let (director, mgr) = manager();
    let inner = mgr.clone();
    let err = mgr
        .with_lock("bosh", move |doc| {
            inner.force_release("bosh");
            Ok((format!("{}changed", doc), ()))
        })
        .await
        .expect_err("token mismatch");
    assert!(matches!(err, FabrikError::Forbidden(_)));
    assert_eq!(director.get_config("cloud", "bosh").await.expect("config"), None);
    assert!(mgr.holder("bosh").is_none());
}

#[tokio::test]
async fn keys_are_independent() {
    let (director, mgr) = manager();
    let a = mgr.with_lock("a", |doc| Ok((format!("{}x", doc), 1)));
    let b = mgr.with_lock("b", |doc| Ok((format!("{}y", doc), 2)));
    let (ra, rb) = tokio::join!(a, b);
    assert_eq!((ra.expect("a"), rb.expect("b")), (1, 2));
    assert_eq!(director.get_config("cloud", "a").await.expect("a").as_deref(), Some("x"));
    assert_eq!(director.get_config("cloud", "b").await.expect("b").as_deref(), Some("y"));
}
