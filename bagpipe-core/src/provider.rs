//! Storage provider status: proof checks coalesced per contract, cached for a short window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::meta::BagInfo;
use crate::pricing::ProviderRates;
use crate::proof::{piece_for_byte, pieces_count, verify_inclusion_proof};

/// A status younger than this is served without asking the provider again.
pub const STATUS_FRESH_FOR: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProviderApiError(pub String);

/// Provider's answer to a storage info query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageInfo {
    pub status: String,
    pub reason: String,
    pub downloaded: u64,
    /// Merkle proof BOC for the piece holding the requested byte.
    pub proof: Vec<u8>,
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn storage_info(
        &self,
        provider_key: &[u8; 32],
        contract: &str,
        proof_byte: u64,
    ) -> Result<StorageInfo, ProviderApiError>;

    async fn storage_rates(
        &self,
        provider_key: &[u8; 32],
        size: u64,
    ) -> Result<ProviderRates, ProviderApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatesError {
    #[error("provider is not found")]
    NotFound,
    #[error("provider is not respond in a given time")]
    NoResponse,
    #[error("failed to get rates: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub status: String,
    pub reason: String,
    pub progress: f64,
    #[serde(skip)]
    pub fetched_at: Option<Instant>,
}

impl ProviderStatus {
    fn connecting() -> Self {
        Self {
            status: "connecting...".into(),
            reason: String::new(),
            progress: 0.0,
            fetched_at: None,
        }
    }
}

/// What a status job needs to know about the bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRequest {
    pub provider_key: [u8; 32],
    pub file_size: u64,
    pub piece_size: u32,
    pub root_hash: [u8; 32],
}

impl StatusRequest {
    pub fn for_bag(provider_key: [u8; 32], info: &BagInfo) -> Self {
        Self {
            provider_key,
            file_size: info.file_size,
            piece_size: info.piece_size,
            root_hash: info.root_hash,
        }
    }
}

enum Entry {
    Pending { current: ProviderStatus, job: AbortHandle },
    Ready { current: ProviderStatus, at: Instant },
}

struct Inner {
    api: Arc<dyn ProviderApi>,
    fresh_for: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    changed: watch::Sender<Option<String>>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, contract: String, status: ProviderStatus) {
        let at = status.fetched_at.unwrap_or_else(Instant::now);
        self.entries().insert(
            contract.clone(),
            Entry::Ready {
                current: status,
                at,
            },
        );
        self.changed.send_replace(Some(contract));
    }
}

pub struct ProviderStatusCache {
    inner: Arc<Inner>,
}

impl ProviderStatusCache {
    pub fn new(api: Arc<dyn ProviderApi>) -> Self {
        Self::with_freshness(api, STATUS_FRESH_FOR)
    }

    pub fn with_freshness(api: Arc<dyn ProviderApi>, fresh_for: Duration) -> Self {
        let (changed, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                api,
                fresh_for,
                entries: Mutex::new(HashMap::new()),
                changed,
            }),
        }
    }

    /// Latest known status of `contract`. Never waits on the provider: a refresh job is
    /// started in the background when the entry is missing or stale and none is running.
    /// Must be called within a tokio runtime.
    pub fn get_status(&self, contract: &str, request: &StatusRequest) -> ProviderStatus {
        let mut entries = self.inner.entries();
        match entries.get(contract) {
            // a job that ended without completing has panicked
            Some(Entry::Pending { current, job }) if !job.is_finished() => return current.clone(),
            Some(Entry::Ready { current, at }) if at.elapsed() < self.inner.fresh_for => {
                return current.clone();
            }
            _ => {}
        }

        let current = match entries.remove(contract) {
            Some(Entry::Ready { current, .. } | Entry::Pending { current, .. }) => current,
            _ => ProviderStatus::connecting(),
        };
        let job = self.spawn_job(contract.to_string(), request.clone());
        entries.insert(
            contract.to_string(),
            Entry::Pending {
                current: current.clone(),
                job,
            },
        );
        current
    }

    fn spawn_job(&self, contract: String, request: StatusRequest) -> AbortHandle {
        let proof_byte = if request.file_size > 0 {
            rand::thread_rng().gen_range(0..request.file_size)
        } else {
            0
        };
        let api = Arc::clone(&self.inner.api);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        debug!(target: "bagpipe::provider", %contract, proof_byte, "requesting storage info");
        tokio::spawn(async move {
            let answer = api
                .storage_info(&request.provider_key, &contract, proof_byte)
                .await;
            let status = evaluate(&contract, answer, &request, proof_byte);
            if let Some(inner) = inner.upgrade() {
                inner.complete(contract, status);
            }
        })
        .abort_handle()
    }

    /// Number of refresh jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.inner
            .entries()
            .values()
            .filter(|e| matches!(e, Entry::Pending { job, .. } if !job.is_finished()))
            .count()
    }

    /// Receives the contract address of every entry that got a new value.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.changed.subscribe()
    }

    /// Ask a provider for its offer on a bag of `file_size` bytes.
    pub async fn fetch_rates(
        &self,
        provider_key: &[u8; 32],
        file_size: u64,
    ) -> Result<ProviderRates, RatesError> {
        match self.inner.api.storage_rates(provider_key, file_size).await {
            Ok(rates) => Ok(ProviderRates {
                size: file_size,
                ..rates
            }),
            Err(ProviderApiError(msg)) if msg.contains("value is not found") => {
                Err(RatesError::NotFound)
            }
            Err(ProviderApiError(msg)) if msg.contains("deadline exceeded") => {
                Err(RatesError::NoResponse)
            }
            Err(ProviderApiError(msg)) => Err(RatesError::Failed(msg)),
        }
    }
}

impl Drop for ProviderStatusCache {
    fn drop(&mut self) {
        for entry in self.inner.entries().values() {
            if let Entry::Pending { job, .. } = entry {
                job.abort();
            }
        }
    }
}

fn evaluate(
    contract: &str,
    answer: Result<StorageInfo, ProviderApiError>,
    request: &StatusRequest,
    proof_byte: u64,
) -> ProviderStatus {
    let fetched_at = Some(Instant::now());
    let info = match answer {
        Ok(info) => info,
        Err(e) => {
            warn!(target: "bagpipe::provider", %contract, error = %e, "failed to get storage info");
            return ProviderStatus {
                status: "inactive".into(),
                reason: e.0,
                progress: 0.0,
                fetched_at,
            };
        }
    };

    let progress = if request.file_size > 0 {
        info.downloaded as f64 / request.file_size as f64 * 100.0
    } else {
        0.0
    };
    let (status, reason) = match info.status.as_str() {
        "active" => {
            let piece = piece_for_byte(proof_byte, request.piece_size);
            let pieces = pieces_count(request.file_size, request.piece_size);
            match verify_inclusion_proof(&info.proof, &request.root_hash, piece, pieces) {
                Ok(()) => ("active".to_string(), "Storage proof received just now".to_string()),
                Err(e) => {
                    debug!(target: "bagpipe::provider", %contract, piece, error = %e, "storage proof rejected");
                    ("untrusted".to_string(), "Incorrect proof received".to_string())
                }
            }
        }
        "downloading" => (info.status.clone(), format!("Progress: {progress:.2}%")),
        "resolving" => (
            info.status.clone(),
            "Provider is trying to find source to download bag".to_string(),
        ),
        "warning-balance" => (
            info.status.clone(),
            "Not enough balance to store bag, please topup or it will be deleted soon".to_string(),
        ),
        _ => (info.status.clone(), info.reason.clone()),
    };
    ProviderStatus {
        status,
        reason,
        progress,
        fetched_at,
    }
}
