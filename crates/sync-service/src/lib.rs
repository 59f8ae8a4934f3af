pub mod client;
pub mod controller;
pub mod registry;
pub mod types;

pub use client::{ChainClient, ClientFactory, EvmRpcClient, FetchError, RpcClientFactory, RpcError};
pub use controller::{SyncController, SyncError};
pub use registry::{ChainRegistry, SecretResolver};
pub use types::{ChainDescriptor, ChainOutcome, ClientKind, SkipReason, SyncSettings};
