mod common;

use async_trait::async_trait;
use common::{init_logging, FakeCake};
use layercake::{
    errors::CakeError, fetcher::Image, CakeOrdinator, IdTranslator, ImageFetcher, LayerCreator,
    LayerId, QuotaScope, ReferenceTracker, RootfsSpec, UidNamespacer,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    runtime::Runtime,
    sync::{mpsc, Semaphore},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

/// Fetcher that announces each fetch, then waits for a permit
struct GatedFetcher {
    started: mpsc::UnboundedSender<String>,
    gate: Arc<Semaphore>,
    budgets: Mutex<Vec<u64>>,
}

#[async_trait]
impl ImageFetcher for GatedFetcher {
    async fn fetch(
        &self,
        rootfs: &str,
        max_size: u64,
        _cancel: &CancellationToken,
    ) -> Result<Image, CakeError> {
        self.budgets.lock().unwrap().push(max_size);
        let _ = self.started.send(rootfs.to_owned());
        self.gate.acquire().await.unwrap().forget();
        Ok(Image {
            image_id: "base".into(),
            layer_ids: vec!["base".into()],
            ..Default::default()
        })
    }

    async fn fetch_id(&self, _rootfs: &str) -> Result<LayerId, CakeError> {
        Ok(LayerId::DockerImage("base".into()))
    }
}

struct Harness {
    cake: Arc<FakeCake>,
    fetcher: Arc<GatedFetcher>,
    started: mpsc::UnboundedReceiver<String>,
    ordinator: Arc<CakeOrdinator>,
}

fn harness() -> Harness {
    let cake = Arc::new(FakeCake::new());
    cake.insert("base", None);
    let (tx, started) = mpsc::unbounded_channel();
    let fetcher = Arc::new(GatedFetcher {
        started: tx,
        gate: Arc::new(Semaphore::new(0)),
        budgets: Default::default(),
    });
    let tracker = Arc::new(ReferenceTracker::new(cake.clone(), true));
    let creator = LayerCreator::new(
        tracker.clone(),
        Arc::new(UidNamespacer::new(IdTranslator::default())),
    );
    let ordinator = Arc::new(CakeOrdinator::new(tracker, fetcher.clone(), creator));
    Harness {
        cake,
        fetcher,
        started,
        ordinator,
    }
}

fn spec(rootfs: &str) -> RootfsSpec {
    RootfsSpec {
        rootfs: rootfs.into(),
        namespaced: false,
        quota_size: 4096,
        quota_scope: QuotaScope::Total,
    }
}

#[test]
fn remove_waits_for_create_and_blocks_new_creates() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let mut h = harness();
        h.cake.insert("old-container", Some("base"));
        let (mut removes, remove_gate) = h.cake.gate_removes();

        let ordinator = h.ordinator.clone();
        let first = tokio::spawn(async move {
            ordinator
                .create("first", &spec("/first"), &CancellationToken::new())
                .await
        });
        assert_eq!(h.started.recv().await.unwrap(), "/first");

        let ordinator = h.ordinator.clone();
        let remove = tokio::spawn(async move {
            ordinator
                .remove(&LayerId::Container("old-container".into()))
                .await
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!remove.is_finished());
        assert!(removes.try_recv().is_err());

        let ordinator = h.ordinator.clone();
        let second = tokio::spawn(async move {
            ordinator
                .create("second", &spec("/second"), &CancellationToken::new())
                .await
        });
        sleep(Duration::from_millis(50)).await;
        assert!(h.started.try_recv().is_err());

        // let the first create finish; the remove goes next
        h.fetcher.gate.add_permits(1);
        first.await.unwrap().unwrap();
        assert_eq!(removes.recv().await.unwrap(), "old-container");
        sleep(Duration::from_millis(50)).await;
        assert!(h.started.try_recv().is_err());
        assert!(!second.is_finished());

        remove_gate.add_permits(1);
        remove.await.unwrap().unwrap();
        assert!(!h.cake.contains("old-container"));

        assert_eq!(h.started.recv().await.unwrap(), "/second");
        h.fetcher.gate.add_permits(1);
        second.await.unwrap().unwrap();
        assert!(h.cake.contains("second"));
        // base still has children, so it survives
        assert!(h.cake.contains("base"));
    })
}

#[test]
fn creates_run_concurrently() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let mut h = harness();
        let mut tasks = Vec::new();
        for name in &["a", "b", "c"] {
            let ordinator = h.ordinator.clone();
            let name = name.to_string();
            tasks.push(tokio::spawn(async move {
                ordinator
                    .create(&name, &spec(&format!("/{}", name)), &CancellationToken::new())
                    .await
            }));
        }
        for _ in 0..3 {
            h.started.recv().await.unwrap();
        }
        h.fetcher.gate.add_permits(3);
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        for name in &["a", "b", "c"] {
            assert!(h.cake.contains(name));
        }
    })
}

#[test]
fn quota_scope_sets_fetch_budget() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let h = harness();
        h.fetcher.gate.add_permits(2);
        let total = spec("/total");
        let exclusive = RootfsSpec {
            quota_scope: QuotaScope::Exclusive,
            ..spec("/exclusive")
        };
        let cancel = CancellationToken::new();
        h.ordinator.create("total", &total, &cancel).await.unwrap();
        h.ordinator
            .create("exclusive", &exclusive, &cancel)
            .await
            .unwrap();
        assert_eq!(h.fetcher.budgets.lock().unwrap().clone(), vec![4096, u64::MAX]);
    })
}

#[test]
fn retained_image_survives_container_removal() {
    init_logging();
    Runtime::new().unwrap().block_on(async {
        let h = harness();
        h.fetcher.gate.add_permits(1);
        h.ordinator.retain(&LayerId::DockerImage("base".into()));
        h.ordinator
            .create("only", &spec("/only"), &CancellationToken::new())
            .await
            .unwrap();
        h.ordinator
            .remove(&LayerId::Container("only".into()))
            .await
            .unwrap();
        assert!(!h.cake.contains("only"));
        assert!(h.cake.contains("base"));
    })
}
