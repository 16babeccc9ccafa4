//! seqview - connection orchestrator for genome-browser sessions.
//!
//! Given a sequence region and a list of configured data sources, a
//! [`View`] opens one independent worker per source, drives each through an
//! ordered pipeline of interdependent requests (create, open, server info,
//! feature sets, styles, context, features, optional sequence), polls all
//! workers cooperatively without blocking, applies per-failure policies
//! independently per connection, and merges the per-source results into one
//! canonical feature model with diff tracking for incremental rendering.
//!
//! # Architecture
//!
//! ```text
//!            +------------+   requests    +--------------+
//!            |            | ------------> | worker (src1)|
//!  ticker -->|   View     |   try_recv    +--------------+
//!  (poll)    | poll loop  | <- replies -- | worker (srcN)|
//!            |            |               +--------------+
//!            +------------+
//!                  |  merged diffs
//!                  v
//!            ViewObserver (rendering layer)
//! ```
//!
//! N worker threads (opaque, owned by the embedder's [`worker::SourceService`]
//! implementations) plus one single-threaded poll loop that is the only
//! mutation site - the orchestrator core needs no internal locking. See
//! [`view::drive`] for a ready-made tokio ticker.

pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod view;
pub mod worker;

pub use config::{load_sources, SourceDescriptor, SourceRoles};
pub use context::{
    merge::MergeDiff, Alignment, Block, Feature, FeatureContext, FeatureSet, Region, Span, Strand,
    Style, StyleSet,
};
pub use error::{Result, ViewError};
pub use protocol::{Reply, ReplyPayload, Request, RequestPayload, ServerInfo, StageKind};
pub use view::{
    drive, Connection, ConnectionId, LoadStats, OnFailPolicy, View, ViewObserver, ViewState,
};
pub use worker::{
    spawn_service_worker, worker_channel, ServiceError, SourceService, WorkerChannel,
    WorkerEndpoint, WorkerFactory,
};
