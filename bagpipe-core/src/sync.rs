//! Bag state synchronizer: polls the daemon and publishes a display snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::client::{format_bag_id, parse_bag_id, ClientError, StorageClient};
use crate::protocol::BagId;
use crate::views::{
    file_tree, peer_views, plain_files, BagInfoView, BagState, BagView, FileNode, PeerView,
    PlainFile, SpeedSummary,
};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub interval: Duration,
    /// Show zero speeds as blank in the list.
    pub hide_zero_speed: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            hide_zero_speed: true,
        }
    }
}

/// Source of uploaded byte counts, used for the upload/download ratio.
pub trait UploadStats: Send + Sync {
    fn uploaded(&self, id: &BagId) -> Option<u64>;
}

struct Shared {
    client: StorageClient,
    options: SyncOptions,
    upload_stats: Option<Arc<dyn UploadStats>>,
    bags: RwLock<Arc<Vec<BagView>>>,
    generation: watch::Sender<u64>,
    speed: watch::Sender<SpeedSummary>,
    /// Held for a whole tick.
    tick: AsyncMutex<()>,
}

impl Shared {
    async fn sync_once(&self) -> Result<(), ClientError> {
        let _tick = self.tick.lock().await;
        let records = self.client.list_bags().await?;
        let previous = Arc::clone(&*self.bags.read().await);
        let inactive: HashMap<&str, &BagView> = previous
            .iter()
            .filter(|v| v.state == BagState::Inactive)
            .map(|v| (v.id.as_str(), v))
            .collect();

        let mut list = Vec::with_capacity(records.len());
        let (mut download, mut upload) = (0f64, 0f64);
        let mut reused = 0usize;
        for record in &records {
            if !record.active_download && !record.active_upload {
                if let Some(prev) = inactive.get(format_bag_id(&record.id).as_str()) {
                    list.push((*prev).clone());
                    reused += 1;
                    continue;
                }
            }

            let detail = self.client.bag_detail(record.id).await?;
            download += detail.bag.download_speed;
            upload += detail.bag.upload_speed;
            let Some(mut view) = BagView::from_detail(&detail, self.options.hide_zero_speed)
            else {
                continue;
            };
            view.peers = self.client.peers(record.id).await?.peers.len();
            view.ratio = self.ratio(&record.id, view.figures.downloaded);
            list.push(view);
        }

        debug!(
            target: "bagpipe::sync",
            bags = list.len(),
            reused,
            "snapshot refreshed"
        );
        *self.bags.write().await = Arc::new(list);
        self.generation.send_modify(|g| *g += 1);
        self.speed.send_replace(SpeedSummary::new(download, upload));
        Ok(())
    }

    fn ratio(&self, id: &BagId, downloaded: u64) -> Option<f64> {
        let uploaded = self.upload_stats.as_ref()?.uploaded(id)?;
        (downloaded > 0).then(|| uploaded as f64 / downloaded as f64)
    }
}

/// Owns the published bag list and the polling task.
pub struct BagSynchronizer {
    shared: Arc<Shared>,
    task: Mutex<Option<AbortHandle>>,
}

impl BagSynchronizer {
    pub fn new(client: StorageClient, options: SyncOptions) -> Self {
        Self::with_upload_stats(client, options, None)
    }

    pub fn with_upload_stats(
        client: StorageClient,
        options: SyncOptions,
        upload_stats: Option<Arc<dyn UploadStats>>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        let (speed, _) = watch::channel(SpeedSummary::default());
        Self {
            shared: Arc::new(Shared {
                client,
                options,
                upload_stats,
                bags: RwLock::new(Arc::new(Vec::new())),
                generation,
                speed,
                tick: AsyncMutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &StorageClient {
        &self.shared.client
    }

    /// Start polling. No-op while already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = shared.sync_once().await {
                    warn!(target: "bagpipe::sync", error = %e, "bag sync failed");
                }
            }
        });
        *task = Some(handle.abort_handle());
    }

    pub fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Run a single tick. On error the previous snapshot stays published.
    pub async fn sync_once(&self) -> Result<(), ClientError> {
        self.shared.sync_once().await
    }

    pub async fn snapshot(&self) -> Arc<Vec<BagView>> {
        Arc::clone(&*self.shared.bags.read().await)
    }

    /// Bumped after every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.generation.subscribe()
    }

    pub fn subscribe_speed(&self) -> watch::Receiver<SpeedSummary> {
        self.shared.speed.subscribe()
    }

    /// `None` while the bag has no wanted files.
    pub async fn bag_info(&self, id: &str) -> Result<Option<BagInfoView>, ClientError> {
        let id = parse_bag_id(id)?;
        let client = &self.shared.client;
        let peers = client.peers(id).await?;
        let detail = client.bag_detail(id).await?;
        Ok(BagInfoView::from_detail(&detail, &peers))
    }

    pub async fn bag_files(&self, id: &str) -> Result<Vec<FileNode>, ClientError> {
        let detail = self.shared.client.bag_detail(parse_bag_id(id)?).await?;
        Ok(file_tree(&detail.files))
    }

    pub async fn plain_files(&self, id: &str) -> Result<Vec<PlainFile>, ClientError> {
        let detail = self.shared.client.bag_detail(parse_bag_id(id)?).await?;
        Ok(plain_files(&detail))
    }

    pub async fn peer_views(&self, id: &str) -> Result<Vec<PeerView>, ClientError> {
        let peers = self.shared.client.peers(parse_bag_id(id)?).await?;
        Ok(peer_views(&peers))
    }
}

impl Drop for BagSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BagDetail, BagRecord, FileRecord, PeerList, Request, Response};
    use crate::transport::{LocalTransport, QueryTransport, TransportError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record(id: u8, active: bool) -> BagRecord {
        BagRecord {
            id: [id; 32],
            active_download: active,
            download_speed: if active { 1024.0 } else { 0.0 },
            ..BagRecord::default()
        }
    }

    fn with_files(bag: BagRecord) -> BagDetail {
        BagDetail {
            bag,
            files: vec![FileRecord {
                name: "f".into(),
                size: 1000,
                priority: 1,
                downloaded_size: 500,
                ..FileRecord::default()
            }],
        }
    }

    struct FakeDaemon {
        active: AtomicBool,
        detail_calls: AtomicUsize,
        fail_list: AtomicBool,
    }

    fn synchronizer(daemon: Arc<FakeDaemon>) -> BagSynchronizer {
        let transport = LocalTransport::with_engine(move |request| match request {
            Request::GetBags if daemon.fail_list.load(Ordering::SeqCst) => {
                Response::Error("not ready".into())
            }
            Request::GetBags => Response::BagList(vec![
                record(1, true),
                record(2, daemon.active.load(Ordering::SeqCst)),
            ]),
            Request::GetBagFull { id } => {
                daemon.detail_calls.fetch_add(1, Ordering::SeqCst);
                Response::BagFull(with_files(record(id[0], id[0] == 1 || daemon.active.load(Ordering::SeqCst))))
            }
            Request::GetPeers { .. } => Response::PeerList(PeerList::default()),
            _ => Response::Error("unsupported".into()),
        });
        BagSynchronizer::new(
            StorageClient::new(Arc::new(transport)),
            SyncOptions::default(),
        )
    }

    #[tokio::test]
    async fn inactive_bags_are_not_refetched() {
        let daemon = Arc::new(FakeDaemon {
            active: AtomicBool::new(false),
            detail_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        });
        let sync = synchronizer(Arc::clone(&daemon));

        sync.sync_once().await.unwrap();
        assert_eq!(daemon.detail_calls.load(Ordering::SeqCst), 2);
        sync.sync_once().await.unwrap();
        assert_eq!(daemon.detail_calls.load(Ordering::SeqCst), 3);

        let snapshot = sync.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].state, BagState::Downloading);
        assert_eq!(snapshot[0].progress, 50.0);
        assert_eq!(snapshot[1].state, BagState::Inactive);

        daemon.active.store(true, Ordering::SeqCst);
        sync.sync_once().await.unwrap();
        assert_eq!(daemon.detail_calls.load(Ordering::SeqCst), 5);
        assert_eq!(sync.snapshot().await[1].state, BagState::Downloading);
    }

    #[tokio::test]
    async fn failed_tick_keeps_previous_snapshot() {
        let daemon = Arc::new(FakeDaemon {
            active: AtomicBool::new(true),
            detail_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        });
        let sync = synchronizer(Arc::clone(&daemon));
        let mut generations = sync.subscribe();
        let speed = sync.subscribe_speed();

        sync.sync_once().await.unwrap();
        assert!(generations.has_changed().unwrap());
        generations.borrow_and_update();
        assert_eq!(speed.borrow().download, "2.00 KB/s");

        daemon.fail_list.store(true, Ordering::SeqCst);
        assert!(matches!(sync.sync_once().await, Err(ClientError::Daemon(_))));
        assert!(!generations.has_changed().unwrap());
        assert_eq!(sync.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn polling_loop_publishes_and_stops() {
        let daemon = Arc::new(FakeDaemon {
            active: AtomicBool::new(true),
            detail_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        });
        let sync = synchronizer(daemon);
        let mut generations = sync.subscribe();
        sync.start();
        sync.start();
        tokio::time::timeout(Duration::from_secs(5), generations.changed())
            .await
            .unwrap()
            .unwrap();
        sync.stop();
        assert_eq!(sync.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn ratio_uses_upload_stats() {
        struct Fixed;
        impl UploadStats for Fixed {
            fn uploaded(&self, _: &BagId) -> Option<u64> {
                Some(1000)
            }
        }
        let transport = LocalTransport::with_engine(|request| match request {
            Request::GetBags => Response::BagList(vec![record(1, true)]),
            Request::GetBagFull { .. } => Response::BagFull(with_files(record(1, true))),
            Request::GetPeers { .. } => Response::PeerList(PeerList::default()),
            _ => Response::Error("unsupported".into()),
        });
        let sync = BagSynchronizer::with_upload_stats(
            StorageClient::new(Arc::new(transport)),
            SyncOptions::default(),
            Some(Arc::new(Fixed)),
        );
        sync.sync_once().await.unwrap();
        assert_eq!(sync.snapshot().await[0].ratio, Some(2.0));
    }

    /// Counts list queries that overlap in time.
    #[derive(Default)]
    struct SlowList {
        listing: AtomicUsize,
        overlapped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl QueryTransport for SlowList {
        async fn query(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            if self.listing.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.listing.fetch_sub(1, Ordering::SeqCst);
            assert_eq!(Request::decode(&request).unwrap(), Request::GetBags);
            Ok(Response::BagList(Vec::new()).encode().unwrap())
        }
    }

    #[tokio::test]
    async fn ticks_never_overlap() {
        let daemon = Arc::new(SlowList::default());
        let sync = Arc::new(BagSynchronizer::new(
            StorageClient::new(daemon.clone()),
            SyncOptions::default(),
        ));
        let ticks: Vec<_> = (0..4)
            .map(|_| {
                let sync = Arc::clone(&sync);
                tokio::spawn(async move { sync.sync_once().await })
            })
            .collect();
        for t in ticks {
            t.await.unwrap().unwrap();
        }
        assert!(!daemon.overlapped.load(Ordering::SeqCst));
        assert_eq!(*sync.subscribe().borrow(), 4);
    }
}
