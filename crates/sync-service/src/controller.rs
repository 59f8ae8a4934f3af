use std::sync::Arc;

use chain_store::{ChainStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::registry::ChainRegistry;
use crate::types::{ChainDescriptor, ChainOutcome, SkipReason, SyncSettings};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Cursor durability can no longer be guaranteed; the process must stop
    /// rather than risk re-fetching or skipping heights.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Drives repeated passes over all enabled chains until cancelled.
///
/// Within a pass each chain is handled sequentially: at most one fetch is
/// in flight per chain, and a fetch that has started always runs to its
/// success or failure before shutdown takes effect.
pub struct SyncController {
    registry: ChainRegistry,
    clients: Arc<dyn ClientFactory>,
    store: Arc<ChainStore>,
    settings: SyncSettings,
}

impl SyncController {
    pub fn new(
        registry: ChainRegistry,
        clients: Arc<dyn ClientFactory>,
        store: Arc<ChainStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            registry,
            clients,
            store,
            settings,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        info!(
            safety_margin = self.settings.safety_margin,
            "sync controller started"
        );
        while !cancel.is_cancelled() {
            let descriptors = self.registry.load().await?;
            for descriptor in descriptors {
                if cancel.is_cancelled() {
                    break;
                }
                let outcome = self.sync_chain(&descriptor).await?;
                self.report(&descriptor, &outcome);
                if matches!(outcome, ChainOutcome::AtBoundary) {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.cooldown) => {}
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.pass_interval) => {}
            }
        }
        info!("sync controller stopped");
        Ok(())
    }

    /// One chain, one pass. Only a cursor-persistence failure escapes as an
    /// error; everything else is isolated into the outcome.
    async fn sync_chain(&self, descriptor: &ChainDescriptor) -> Result<ChainOutcome, SyncError> {
        if descriptor.endpoint.is_empty() {
            return Ok(ChainOutcome::Skipped(SkipReason::EmptyEndpoint));
        }
        let client = match self.clients.client_for(descriptor) {
            Ok(client) => client,
            Err(reason) => return Ok(ChainOutcome::Skipped(reason)),
        };
        let tip = match client.latest_block_number().await {
            Ok(tip) => tip,
            Err(err) => return Ok(ChainOutcome::Skipped(SkipReason::TipQuery(err))),
        };

        // The safe frontier. A tip shallower than the margin has nothing
        // fetchable at all.
        let Some(boundary) = tip.checked_sub(self.settings.safety_margin) else {
            return Ok(ChainOutcome::Synced);
        };

        if descriptor.cursor < boundary {
            match client.fetch(descriptor.cursor).await {
                Ok(()) => {
                    let advanced = descriptor.cursor + 1;
                    self.store.update_height(descriptor.id, advanced)?;
                    Ok(ChainOutcome::Lagging {
                        fetched: descriptor.cursor,
                        cursor: advanced,
                    })
                }
                Err(err) => Ok(ChainOutcome::Skipped(SkipReason::Fetch(err))),
            }
        } else if descriptor.cursor == boundary {
            Ok(ChainOutcome::AtBoundary)
        } else {
            Ok(ChainOutcome::Synced)
        }
    }

    fn report(&self, descriptor: &ChainDescriptor, outcome: &ChainOutcome) {
        match outcome {
            ChainOutcome::Lagging { fetched, cursor } => {
                info!(chain = %descriptor.key, fetched, cursor, "ingested block");
            }
            ChainOutcome::AtBoundary => {
                debug!(
                    chain = %descriptor.key,
                    cursor = descriptor.cursor,
                    "caught up to safety boundary, cooling down"
                );
            }
            ChainOutcome::Synced => {
                debug!(chain = %descriptor.key, cursor = descriptor.cursor, "already synchronized");
            }
            ChainOutcome::Skipped(reason) => match reason {
                SkipReason::EmptyEndpoint => {
                    warn!(chain = %descriptor.key, "endpoint is empty, skipping");
                }
                SkipReason::UnknownClientKind => {
                    warn!(
                        chain = %descriptor.key,
                        client_kind = %descriptor.client_kind,
                        "unknown client kind, skipping"
                    );
                }
                SkipReason::InvalidEndpoint(err) => {
                    warn!(?err, chain = %descriptor.key, "invalid endpoint, skipping");
                }
                SkipReason::TipQuery(err) => {
                    warn!(?err, chain = %descriptor.key, "tip query failed, will retry next pass");
                }
                SkipReason::Fetch(err) => {
                    warn!(
                        ?err,
                        chain = %descriptor.key,
                        height = descriptor.cursor,
                        "fetch failed, will retry next pass"
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncController, SyncError};
    use crate::client::{ChainClient, ClientFactory, FetchError, RpcError};
    use crate::registry::{ChainRegistry, SecretResolver};
    use crate::types::{ChainDescriptor, ChainOutcome, SkipReason, SyncSettings};
    use async_trait::async_trait;
    use chain_store::{ChainRecord, ChainStore, StoreConfig};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join("blocksync-controller-tests");
        fs::create_dir_all(&dir).expect("create temp dir");
        let pid = std::process::id();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        dir.join(format!("controller-{pid}-{nanos}"))
    }

    struct MockClient {
        tip: Result<u64, ()>,
        fetch_fails: bool,
        tip_queries: AtomicU64,
        fetched: Mutex<Vec<u64>>,
    }

    impl MockClient {
        fn with_tip(tip: u64) -> Arc<Self> {
            Arc::new(Self {
                tip: Ok(tip),
                fetch_fails: false,
                tip_queries: AtomicU64::new(0),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn failing_tip() -> Arc<Self> {
            Arc::new(Self {
                tip: Err(()),
                fetch_fails: false,
                tip_queries: AtomicU64::new(0),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn failing_fetch(tip: u64) -> Arc<Self> {
            Arc::new(Self {
                tip: Ok(tip),
                fetch_fails: true,
                tip_queries: AtomicU64::new(0),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn fetched(&self) -> Vec<u64> {
            self.fetched.lock().expect("fetched lock").clone()
        }
    }

    #[async_trait]
    impl ChainClient for MockClient {
        async fn latest_block_number(&self) -> Result<u64, RpcError> {
            self.tip_queries.fetch_add(1, Ordering::Relaxed);
            self.tip.map_err(|()| RpcError::MissingResult)
        }

        async fn fetch(&self, height: u64) -> Result<(), FetchError> {
            if self.fetch_fails {
                return Err(FetchError::MissingBlock { height });
            }
            self.fetched.lock().expect("fetched lock").push(height);
            Ok(())
        }
    }

    struct MockFactory {
        client: Arc<MockClient>,
    }

    impl ClientFactory for MockFactory {
        fn client_for(
            &self,
            _descriptor: &ChainDescriptor,
        ) -> Result<Arc<dyn ChainClient>, SkipReason> {
            Ok(Arc::clone(&self.client) as Arc<dyn ChainClient>)
        }
    }

    struct PassthroughResolver;

    #[async_trait]
    impl SecretResolver for PassthroughResolver {
        async fn decrypt(
            &self,
            ciphertext: &str,
        ) -> Result<String, vault_secrets::DecryptError> {
            Ok(ciphertext.to_string())
        }
    }

    fn record(id: u64, cursor: u64) -> ChainRecord {
        ChainRecord {
            id,
            key: format!("chain-{id}"),
            client_kind: "evm".to_string(),
            encrypted_endpoint: "https://node.example:8545".to_string(),
            cursor,
            enabled: true,
        }
    }

    fn descriptor(id: u64, cursor: u64) -> ChainDescriptor {
        ChainDescriptor {
            id,
            key: format!("chain-{id}"),
            client_kind: "evm".to_string(),
            endpoint: "https://node.example:8545".to_string(),
            cursor,
        }
    }

    struct Fixture {
        root: PathBuf,
        store: Arc<ChainStore>,
        client: Arc<MockClient>,
        controller: SyncController,
    }

    impl Fixture {
        fn new(client: Arc<MockClient>) -> Self {
            Self::with_settings(
                client,
                SyncSettings {
                    safety_margin: 3,
                    cooldown: Duration::from_millis(1),
                    pass_interval: Duration::from_millis(1),
                },
            )
        }

        fn with_settings(client: Arc<MockClient>, settings: SyncSettings) -> Self {
            let root = temp_root();
            let store = Arc::new(
                ChainStore::open(StoreConfig {
                    root_dir: root.clone(),
                })
                .expect("open store"),
            );
            let registry = ChainRegistry::new(Arc::clone(&store), Arc::new(PassthroughResolver));
            let controller = SyncController::new(
                registry,
                Arc::new(MockFactory {
                    client: Arc::clone(&client),
                }),
                Arc::clone(&store),
                settings,
            );
            Self {
                root,
                store,
                client,
                controller,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn lagging_chain_advances_by_one() {
        // cursor=100, tip=104, margin=3: boundary is 101, so height 100 is
        // fetched and the cursor lands on 101.
        let fixture = Fixture::new(MockClient::with_tip(104));
        fixture.store.put_chain(&record(1, 100)).expect("put chain");

        let outcome = fixture
            .controller
            .sync_chain(&descriptor(1, 100))
            .await
            .expect("sync chain");

        assert!(matches!(
            outcome,
            ChainOutcome::Lagging {
                fetched: 100,
                cursor: 101
            }
        ));
        assert_eq!(fixture.client.fetched(), vec![100]);
        let stored = fixture
            .store
            .get_chain(1)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 101);
    }

    #[tokio::test]
    async fn boundary_chain_gets_cooldown_not_fetch() {
        // cursor=101, tip=104, margin=3: exactly at the boundary.
        let fixture = Fixture::new(MockClient::with_tip(104));
        fixture.store.put_chain(&record(1, 101)).expect("put chain");

        let outcome = fixture
            .controller
            .sync_chain(&descriptor(1, 101))
            .await
            .expect("sync chain");

        assert!(matches!(outcome, ChainOutcome::AtBoundary));
        assert!(fixture.client.fetched().is_empty());
        let stored = fixture
            .store
            .get_chain(1)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 101);
    }

    #[tokio::test]
    async fn chain_past_boundary_is_synced() {
        let fixture = Fixture::new(MockClient::with_tip(104));
        let outcome = fixture
            .controller
            .sync_chain(&descriptor(1, 102))
            .await
            .expect("sync chain");
        assert!(matches!(outcome, ChainOutcome::Synced));
        assert!(fixture.client.fetched().is_empty());
    }

    #[tokio::test]
    async fn shallow_tip_is_synced() {
        // tip=2 with margin=3: nothing is deep enough to fetch, and no
        // cooldown either.
        let fixture = Fixture::new(MockClient::with_tip(2));
        let outcome = fixture
            .controller
            .sync_chain(&descriptor(1, 0))
            .await
            .expect("sync chain");
        assert!(matches!(outcome, ChainOutcome::Synced));
        assert!(fixture.client.fetched().is_empty());
    }

    #[tokio::test]
    async fn empty_endpoint_skips_without_tip_query() {
        let fixture = Fixture::new(MockClient::with_tip(104));
        let mut descriptor = descriptor(1, 100);
        descriptor.endpoint = String::new();

        let outcome = fixture
            .controller
            .sync_chain(&descriptor)
            .await
            .expect("sync chain");

        assert!(matches!(
            outcome,
            ChainOutcome::Skipped(SkipReason::EmptyEndpoint)
        ));
        assert_eq!(fixture.client.tip_queries.load(Ordering::Relaxed), 0);
        assert!(fixture.client.fetched().is_empty());
    }

    #[tokio::test]
    async fn tip_failure_leaves_cursor_untouched() {
        let fixture = Fixture::new(MockClient::failing_tip());
        fixture.store.put_chain(&record(1, 100)).expect("put chain");

        let outcome = fixture
            .controller
            .sync_chain(&descriptor(1, 100))
            .await
            .expect("sync chain");

        assert!(matches!(
            outcome,
            ChainOutcome::Skipped(SkipReason::TipQuery(_))
        ));
        let stored = fixture
            .store
            .get_chain(1)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 100);
    }

    #[tokio::test]
    async fn fetch_failure_retries_same_height_next_pass() {
        let fixture = Fixture::new(MockClient::failing_fetch(104));
        fixture.store.put_chain(&record(1, 100)).expect("put chain");

        let outcome = fixture
            .controller
            .sync_chain(&descriptor(1, 100))
            .await
            .expect("sync chain");
        assert!(matches!(
            outcome,
            ChainOutcome::Skipped(SkipReason::Fetch(_))
        ));
        let stored = fixture
            .store
            .get_chain(1)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 100, "no partial advancement");

        // Next pass rebuilds the descriptor from the store and retries the
        // exact same height.
        let retry = fixture
            .controller
            .registry
            .load()
            .await
            .expect("load snapshot");
        assert_eq!(retry[0].cursor, 100);
    }

    #[tokio::test]
    async fn cursor_advances_one_per_pass() {
        let fixture = Fixture::new(MockClient::with_tip(110));
        fixture.store.put_chain(&record(1, 100)).expect("put chain");

        for _ in 0..4 {
            let descriptors = fixture
                .controller
                .registry
                .load()
                .await
                .expect("load snapshot");
            for descriptor in &descriptors {
                fixture
                    .controller
                    .sync_chain(descriptor)
                    .await
                    .expect("sync chain");
            }
        }

        assert_eq!(fixture.client.fetched(), vec![100, 101, 102, 103]);
        let stored = fixture
            .store
            .get_chain(1)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 104);
    }

    #[tokio::test]
    async fn failing_chain_does_not_abort_pass() {
        // A per-chain failure is isolated; the other chain still advances.
        let fixture = Fixture::new(MockClient::with_tip(104));
        fixture.store.put_chain(&record(1, 100)).expect("put chain");
        fixture.store.put_chain(&record(2, 100)).expect("put chain");

        let mut broken = descriptor(1, 100);
        broken.endpoint = String::new();
        let healthy = descriptor(2, 100);

        let first = fixture
            .controller
            .sync_chain(&broken)
            .await
            .expect("sync broken chain");
        assert!(matches!(first, ChainOutcome::Skipped(_)));

        let second = fixture
            .controller
            .sync_chain(&healthy)
            .await
            .expect("sync healthy chain");
        assert!(matches!(second, ChainOutcome::Lagging { .. }));
        let stored = fixture
            .store
            .get_chain(2)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 101);
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal() {
        // Chain exists in the pass snapshot but not in the store: the
        // cursor write fails and the error propagates instead of being
        // swallowed.
        let fixture = Fixture::new(MockClient::with_tip(104));
        let err = fixture
            .controller
            .sync_chain(&descriptor(9, 100))
            .await
            .expect_err("missing chain row is fatal");
        assert!(matches!(err, SyncError::Store(_)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_chain() {
        let fixture = Fixture::new(MockClient::with_tip(104));
        fixture.store.put_chain(&record(1, 100)).expect("put chain");

        let cancel = CancellationToken::new();
        cancel.cancel();
        fixture.controller.run(cancel).await.expect("run");

        assert_eq!(fixture.client.tip_queries.load(Ordering::Relaxed), 0);
        assert!(fixture.client.fetched().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_cooldown_aborts_early() {
        // Chain sits exactly on the boundary, so the first pass goes
        // straight into a long cooldown. Cancelling mid-cooldown must end
        // the run immediately instead of sleeping it out.
        let fixture = Fixture::with_settings(
            MockClient::with_tip(104),
            SyncSettings {
                safety_margin: 3,
                cooldown: Duration::from_secs(30),
                pass_interval: Duration::from_millis(1),
            },
        );
        fixture.store.put_chain(&record(1, 101)).expect("put chain");

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let started = std::time::Instant::now();
        fixture.controller.run(cancel).await.expect("run");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "cooldown was slept out instead of aborted"
        );
        assert!(fixture.client.fetched().is_empty());
    }

    #[tokio::test]
    async fn run_advances_until_cancelled() {
        let fixture = Fixture::new(MockClient::with_tip(104));
        fixture.store.put_chain(&record(1, 100)).expect("put chain");

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        fixture.controller.run(cancel).await.expect("run");

        let stored = fixture
            .store
            .get_chain(1)
            .expect("get chain")
            .expect("chain exists");
        assert_eq!(stored.cursor, 101, "boundary reached, then throttled");
        assert_eq!(fixture.client.fetched(), vec![100]);
    }
}
