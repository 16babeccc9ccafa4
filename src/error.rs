//! Error types for the view orchestrator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ViewError>;

/// Errors surfaced by the view orchestrator.
///
/// Per-source failures (bad URLs, worker spawn failures, request errors) are
/// recovered locally and logged; only session-level failures reach callers.
#[derive(Debug, Error)]
pub enum ViewError {
    /// A source URL could not be parsed.
    #[error("invalid source url '{url}': {reason}")]
    InvalidSourceUrl { url: String, reason: String },

    /// `connect` found no usable source at all.
    #[error("no sources connected: {0}")]
    NoSourcesConnected(String),

    /// A step list is already in flight for this view.
    #[error("a load is already in progress")]
    AlreadyConnecting,

    /// The requested operation is only legal from the Init state.
    #[error("operation requires the Init state (view is {state})")]
    NotInInitState { state: String },

    /// The requested operation is only legal on a fully loaded view.
    #[error("operation requires the Loaded state (view is {state})")]
    NotLoaded { state: String },

    /// The view is tearing down; no further operations are legal.
    #[error("view is being destroyed")]
    ViewDying,

    /// The region bounds are unusable.
    #[error("invalid region '{name}' {start}-{end}: {reason}")]
    InvalidRegion {
        name: String,
        start: u64,
        end: u64,
        reason: String,
    },

    /// A worker could not be spawned for a source.
    #[error("could not spawn worker for '{url}': {reason}")]
    WorkerSpawn { url: String, reason: String },

    /// A feature fragment failed structural validation and was rejected.
    #[error("merge rejected: {0}")]
    MergeRejected(String),

    /// Source configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
