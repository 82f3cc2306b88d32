//! Over-the-air bundle lifecycle for BundleNudge.
//!
//! This crate decides which JavaScript bundle a host application runs at
//! cold start and keeps the on-device bundle directory consistent:
//! - Durable, atomic storage of downloaded bundles and their records.
//! - SHA-256 and app-version verification of candidates.
//! - Manifest checks and streamed downloads through a pluggable transport.
//! - Activation, launch-outcome tracking, and rollback.
//! - A cheap resolver answering "which bundle path, if any".

pub mod activation;
mod atomic;
pub mod fetch;
pub mod record;
pub mod resolver;
pub mod state;
pub mod storage;
pub mod transport;
pub mod verify;

/// Activation state machine and rollback policy.
pub use activation::{ActivationError, ActivationManager, DEFAULT_FAILURE_THRESHOLD};
/// Manifest check and candidate download.
pub use fetch::{FetchError, UpdateCheck, UpdateFetcher};
/// Persistent data model.
pub use record::{ActivationState, BundleRecord, BundleStatus, Manifest};
/// Startup path query.
pub use resolver::BundleResolver;
/// Injected activation state handles.
pub use state::{MemoryStateStore, StateStore};
/// On-disk bundle directory.
pub use storage::{BundleStore, StagedPayload, StorageError};
/// HTTP collaborator seam.
pub use transport::{BundleTransport, PayloadStream, ReqwestTransport, TransportError};
/// Digest and compatibility checks.
pub use verify::{IntegrityVerifier, Verified, VerifyError, is_version_at_least};
