//! Client library for the bag storage daemon.
//! Wire codec, cells, RPC client, state sync, provider proofs and pricing.

pub mod cell;
pub mod client;
pub mod identity;
pub mod meta;
pub mod pricing;
pub mod proof;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod sync;
pub mod transport;
pub mod views;
pub mod wire;

pub use client::{format_bag_id, parse_bag_id, ClientError, StorageClient};
pub use identity::{Keypair, PublicKey};
pub use meta::{BagHeader, BagInfo, BagMeta};
pub use protocol::{BagDetail, BagId, BagRecord, Request, Response, SpeedLimits};
pub use provider::{ProviderApi, ProviderStatus, ProviderStatusCache, StatusRequest};
pub use session::ControlSession;
pub use sync::{BagSynchronizer, SyncOptions};
pub use transport::{LocalTransport, QueryTransport, TransportError};
pub use wire::CodecError;
