//! Live Recorder Service
//!
//! Watches a list of streaming accounts and records each live session to
//! disk with an external capture program.
//!
//! ## Features
//!
//! - **Batched Status Polling**: One rate-limited status query per batch of
//!   watched accounts, with automatic credential refresh on 401
//! - **Identity Resolution**: Login names resolved to canonical IDs through a
//!   persistent SQLite cache
//! - **Storage Failover**: Captures land on the first storage location with
//!   enough free space; dispatches wait when every location is full
//! - **Single Capture per Account**: An atomic active set guarantees no
//!   account is ever recorded twice at the same time
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────┐      ┌──────────────┐
//!                │ Token        │◀─────│ Refresher    │
//!                │ Store        │      └──────────────┘
//!                └──────────────┘
//!                       │
//!                       ▼
//! ┌──────────────┐ ┌──────────────┐   ┌──────────────┐
//! │ Identity     │▶│ Live         │──▶│ Recording    │
//! │ Resolver     │ │ Poller       │   │ Coordinator  │
//! └──────────────┘ └──────────────┘   └──────────────┘
//!        │          (rate limited)      │         │
//!        ▼                              ▼         ▼
//! ┌──────────────┐              ┌────────────┐ ┌────────────┐
//! │ SQLite       │◀─────────────│ Storage    │ │ Capture    │
//! │ Store        │  broadcasts  │ Selector   │ │ Process    │
//! └──────────────┘              └────────────┘ └────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod helix;
pub mod identity;
pub mod poller;
pub mod rate_limiter;
pub mod storage_selector;
pub mod store;
pub mod token_store;

pub use capture::{CaptureError, CaptureRunner, CommandCapture};
pub use config::Config;
pub use coordinator::{ActiveRecording, ActiveRecordingSet, BroadcastLog, RecordingCoordinator};
pub use helix::{AccessToken, ApiError, HelixClient, LiveStream, StreamsApi, TokenSource};
pub use identity::{AccountIdentifier, IdentityCache, Resolution, ResolveError, UserResolver};
pub use poller::{LivePoller, PollState};
pub use rate_limiter::RateLimiter;
pub use storage_selector::{FsSpaceProbe, SpaceProbe, StorageCandidate, StorageSelector};
pub use store::{BroadcastRecord, SqliteStore, StoreError, StoredBroadcast};
pub use token_store::{TokenError, TokenState, TokenStore};
