//! Storage daemon RPC client: one method per daemon capability, one round trip each.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{
    AddOptions, BagDetail, BagId, BagRecord, PeerList, Request, Response, SpeedLimits,
};
use crate::transport::{QueryTransport, TransportError};
use crate::wire::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("{op}: failed to encode request: {source}")]
    Encode {
        op: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("{op}: failed to decode response: {source}")]
    Decode {
        op: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("{op}: unexpected response {got}")]
    UnexpectedResponse { op: &'static str, got: &'static str },
    #[error("{0}")]
    InvalidInput(String),
}

/// Parse a 64-char hex bag id, any case.
pub fn parse_bag_id(hex_id: &str) -> Result<BagId, ClientError> {
    let bytes = hex::decode(hex_id.trim())
        .map_err(|_| ClientError::InvalidInput("invalid hash hex string".into()))?;
    bytes.try_into().map_err(|_| {
        ClientError::InvalidInput("invalid hash size, length should be 64 symbols".into())
    })
}

pub fn format_bag_id(id: &BagId) -> String {
    hex::encode_upper(id)
}

#[derive(Clone)]
pub struct StorageClient {
    transport: Arc<dyn QueryTransport>,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient").finish_non_exhaustive()
    }
}

impl StorageClient {
    pub fn new(transport: Arc<dyn QueryTransport>) -> Self {
        Self { transport }
    }

    async fn call(&self, request: Request) -> Result<Response, ClientError> {
        let op = request.name();
        let encoded = request
            .encode()
            .map_err(|source| ClientError::Encode { op, source })?;
        let raw = self
            .transport
            .query(encoded)
            .await
            .map_err(|source| ClientError::Transport { op, source })?;
        match Response::decode(&raw).map_err(|source| ClientError::Decode { op, source })? {
            Response::Error(message) => {
                debug!(target: "bagpipe::client", op, %message, "daemon rejected query");
                Err(ClientError::Daemon(message))
            }
            response => Ok(response),
        }
    }

    async fn expect_success(&self, request: Request) -> Result<(), ClientError> {
        let op = request.name();
        match self.call(request).await? {
            Response::Success => Ok(()),
            other => Err(unexpected(op, &other)),
        }
    }

    pub async fn list_bags(&self) -> Result<Vec<BagRecord>, ClientError> {
        match self.call(Request::GetBags).await? {
            Response::BagList(bags) => Ok(bags),
            other => Err(unexpected("getTorrents", &other)),
        }
    }

    /// Add a bag by id, downloading its header only. `None` when the daemon already has it.
    pub async fn add_by_hash(
        &self,
        id: BagId,
        root_dir: &str,
    ) -> Result<Option<BagDetail>, ClientError> {
        let request = Request::AddByHash {
            id,
            options: AddOptions::header_only(root_dir),
        };
        let added = self.add(request).await?;
        debug!(target: "bagpipe::client", bag = %format_bag_id(&id), added = added.is_some(), "add by hash");
        Ok(added)
    }

    /// Add a bag from an exported meta file (boxed or bare form).
    pub async fn add_by_meta(
        &self,
        meta: Vec<u8>,
        root_dir: &str,
    ) -> Result<Option<BagDetail>, ClientError> {
        let request = Request::AddByMeta {
            meta,
            options: AddOptions::header_only(root_dir),
        };
        self.add(request).await
    }

    async fn add(&self, request: Request) -> Result<Option<BagDetail>, ClientError> {
        let op = request.name();
        match self.call(request).await {
            Ok(Response::BagFull(detail)) => Ok(Some(detail)),
            Ok(other) => Err(unexpected(op, &other)),
            Err(ClientError::Daemon(message)) if message.contains("duplicate hash") => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_bag(
        &self,
        path: &str,
        description: &str,
        allow_upload: bool,
        copy_inside: bool,
    ) -> Result<BagDetail, ClientError> {
        let request = Request::CreateBag {
            path: path.to_string(),
            description: description.to_string(),
            allow_upload,
            copy_inside,
        };
        match self.call(request).await? {
            Response::BagFull(detail) => Ok(detail),
            other => Err(unexpected("createTorrent", &other)),
        }
    }

    pub async fn bag_detail(&self, id: BagId) -> Result<BagDetail, ClientError> {
        match self.call(Request::GetBagFull { id }).await? {
            Response::BagFull(detail) => Ok(detail),
            other => Err(unexpected("getTorrentFull", &other)),
        }
    }

    /// Exported meta bytes, as the daemon sends them.
    pub async fn bag_meta(&self, id: BagId) -> Result<Vec<u8>, ClientError> {
        match self.call(Request::GetBagMeta { id }).await? {
            Response::BagMeta(data) => Ok(data),
            other => Err(unexpected("getTorrentMeta", &other)),
        }
    }

    pub async fn peers(&self, id: BagId) -> Result<PeerList, ClientError> {
        match self.call(Request::GetPeers { id }).await? {
            Response::PeerList(peers) => Ok(peers),
            other => Err(unexpected("getTorrentPeers", &other)),
        }
    }

    pub async fn remove_bag(&self, id: BagId, remove_files: bool) -> Result<(), ClientError> {
        self.expect_success(Request::RemoveBag { id, remove_files })
            .await
    }

    /// Remove the bag only if no file was ever selected for download. Returns whether it was removed.
    pub async fn remove_bag_if_uninitialized(
        &self,
        id: BagId,
        remove_files: bool,
    ) -> Result<bool, ClientError> {
        let detail = self.bag_detail(id).await?;
        if detail.files.iter().any(|f| f.priority > 0) {
            return Ok(false);
        }
        self.remove_bag(id, remove_files).await?;
        Ok(true)
    }

    /// Toggle download and upload together. The two calls are not atomic: if the second
    /// fails the first stays applied.
    pub async fn set_active(&self, id: BagId, active: bool) -> Result<(), ClientError> {
        self.expect_success(Request::SetActiveDownload { id, active })
            .await?;
        if let Err(e) = self
            .expect_success(Request::SetActiveUpload { id, active })
            .await
        {
            warn!(
                target: "bagpipe::client",
                bag = %format_bag_id(&id),
                active,
                error = %e,
                "download flag changed but upload flag was not"
            );
            return Err(e);
        }
        Ok(())
    }

    pub async fn set_file_priority(
        &self,
        id: BagId,
        name: &str,
        priority: i32,
    ) -> Result<(), ClientError> {
        let request = Request::SetFilePriorityByName {
            id,
            name: name.to_string(),
            priority,
        };
        match self.call(request).await? {
            Response::PrioritySet | Response::PriorityPending => Ok(()),
            other => Err(unexpected("setFilePriorityByName", &other)),
        }
    }

    /// Applied in order; stops at the first failure.
    pub async fn set_files_priority<S: AsRef<str>>(
        &self,
        id: BagId,
        names: &[S],
        priority: i32,
    ) -> Result<(), ClientError> {
        for name in names {
            self.set_file_priority(id, name.as_ref(), priority).await?;
        }
        Ok(())
    }

    pub async fn speed_limits(&self) -> Result<SpeedLimits, ClientError> {
        match self.call(Request::GetSpeedLimits).await? {
            Response::SpeedLimits(limits) => Ok(limits),
            other => Err(unexpected("getSpeedLimits", &other)),
        }
    }

    /// Bytes per second; negative means unlimited. Both limits are always sent.
    pub async fn set_speed_limits(&self, limits: SpeedLimits) -> Result<(), ClientError> {
        self.expect_success(Request::SetSpeedLimits {
            download: Some(limits.download),
            upload: Some(limits.upload),
        })
        .await
    }

    /// Whether the daemon has fetched the bag header (file list).
    pub async fn has_header(&self, id: BagId) -> Result<bool, ClientError> {
        Ok(self.bag_detail(id).await?.bag.has_header())
    }
}

fn unexpected(op: &'static str, got: &Response) -> ClientError {
    ClientError::UnexpectedResponse {
        op,
        got: got.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileRecord, HeaderSummary, PriorityAction};
    use crate::transport::LocalTransport;
    use std::sync::Mutex;

    fn client(engine: impl Fn(Request) -> Response + Send + Sync + 'static) -> StorageClient {
        StorageClient::new(Arc::new(LocalTransport::with_engine(engine)))
    }

    #[test]
    fn bag_id_parsing() {
        let id = parse_bag_id(&"aB".repeat(32)).unwrap();
        assert_eq!(id, [0xab; 32]);
        assert_eq!(format_bag_id(&id), "AB".repeat(32));
        assert!(matches!(parse_bag_id("zz"), Err(ClientError::InvalidInput(m)) if m.contains("hex")));
        assert!(matches!(parse_bag_id("abcd"), Err(ClientError::InvalidInput(m)) if m.contains("64")));
    }

    #[tokio::test]
    async fn duplicate_add_is_success() {
        let c = client(|_| Response::Error("duplicate hash".into()));
        assert_eq!(c.add_by_hash([1; 32], "/tmp").await.unwrap(), None);

        let c = client(|_| Response::Error("no space left".into()));
        assert!(matches!(
            c.add_by_hash([1; 32], "/tmp").await,
            Err(ClientError::Daemon(m)) if m == "no space left"
        ));
    }

    #[tokio::test]
    async fn add_requests_header_only() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let c = client(move |request| {
            *sink.lock().unwrap() = Some(request);
            Response::BagFull(BagDetail::default())
        });
        assert!(c.add_by_meta(vec![1, 2, 3, 4], "/data").await.unwrap().is_some());
        let Some(Request::AddByMeta { meta, options }) = seen.lock().unwrap().take() else {
            panic!("expected addByMeta");
        };
        assert_eq!(meta, vec![1, 2, 3, 4]);
        assert!(options.start_download && options.allow_upload);
        assert_eq!(options.priorities, vec![PriorityAction::All(0)]);
        assert_eq!(options.root_dir, "/data");
    }

    #[tokio::test]
    async fn wrong_variant_is_unexpected() {
        let c = client(|_| Response::Success);
        assert!(matches!(
            c.list_bags().await,
            Err(ClientError::UnexpectedResponse { op: "getTorrents", got: "success" })
        ));
    }

    #[tokio::test]
    async fn set_active_stops_after_first_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&calls);
        let c = client(move |request| {
            log.lock().unwrap().push(request.name());
            match request {
                Request::SetActiveDownload { .. } => Response::Success,
                _ => Response::Error("upload locked".into()),
            }
        });
        assert!(matches!(c.set_active([2; 32], true).await, Err(ClientError::Daemon(_))));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["setActiveDownload", "setActiveUpload"]
        );
    }

    #[tokio::test]
    async fn priority_accepts_pending() {
        let c = client(|_| Response::PriorityPending);
        c.set_files_priority([3; 32], &["a.txt", "b/c.txt"], 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_only_uninitialized() {
        let removed = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&removed);
        let wanted = Arc::new(Mutex::new(0));
        let priority = Arc::clone(&wanted);
        let c = client(move |request| match request {
            Request::GetBagFull { .. } => {
                let mut detail = BagDetail::default();
                detail.files.push(FileRecord {
                    name: "a".into(),
                    size: 10,
                    priority: *priority.lock().unwrap(),
                    ..FileRecord::default()
                });
                Response::BagFull(detail)
            }
            Request::RemoveBag { .. } => {
                *counter.lock().unwrap() += 1;
                Response::Success
            }
            _ => Response::Error("unsupported".into()),
        });
        assert!(c.remove_bag_if_uninitialized([4; 32], false).await.unwrap());
        *wanted.lock().unwrap() = 1;
        assert!(!c.remove_bag_if_uninitialized([4; 32], false).await.unwrap());
        assert_eq!(*removed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn header_presence() {
        let c = client(|_| {
            let mut detail = BagDetail::default();
            detail.bag.header = Some(HeaderSummary {
                files_count: 1,
                included_size: 5,
                dir_name: String::new(),
            });
            Response::BagFull(detail)
        });
        assert!(c.has_header([5; 32]).await.unwrap());
    }

    #[tokio::test]
    async fn transport_failure_is_distinct_from_daemon_error() {
        let c = StorageClient::new(Arc::new(LocalTransport::new(|_| Err(TransportError::Closed))));
        assert!(matches!(
            c.speed_limits().await,
            Err(ClientError::Transport { op: "getSpeedLimits", .. })
        ));
    }

    #[tokio::test]
    async fn oversized_request_is_not_sent() {
        let sent = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&sent);
        let c = StorageClient::new(Arc::new(LocalTransport::new(move |_| {
            *counter.lock().unwrap() += 1;
            Err(TransportError::Closed)
        })));
        let err = c.add_by_meta(vec![0; 1 << 24], "/srv").await.unwrap_err();
        assert!(matches!(err, ClientError::Encode { op: "addByMeta", .. }));
        assert_eq!(*sent.lock().unwrap(), 0);
    }
}
