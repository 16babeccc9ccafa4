//! Typed request/reply payloads for the load pipeline.
//!
//! Every connection is driven through the same ordered stages; each stage
//! owns at most one in-flight request per connection. The payloads here are
//! the call-shaped contract between the orchestrator and its workers - the
//! wire format a worker uses to satisfy them is its own business.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::context::{FeatureContext, Region, StyleSet};

// =============================================================================
// Stages
// =============================================================================

/// The pipeline stages, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    Create,
    Open,
    GetServerInfo,
    GetFeatureSets,
    GetStyles,
    NewContext,
    GetFeatures,
    GetSequence,
}

impl StageKind {
    /// Full pipeline for an initial load, sequence stage included.
    pub const FULL: [StageKind; 8] = [
        StageKind::Create,
        StageKind::Open,
        StageKind::GetServerInfo,
        StageKind::GetFeatureSets,
        StageKind::GetStyles,
        StageKind::NewContext,
        StageKind::GetFeatures,
        StageKind::GetSequence,
    ];

    /// Stages for an incremental load over already-open connections.
    pub const INCREMENTAL: [StageKind; 5] = [
        StageKind::GetFeatureSets,
        StageKind::GetStyles,
        StageKind::NewContext,
        StageKind::GetFeatures,
        StageKind::GetSequence,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Create => "create",
            StageKind::Open => "open",
            StageKind::GetServerInfo => "get-server-info",
            StageKind::GetFeatureSets => "get-feature-sets",
            StageKind::GetStyles => "get-styles",
            StageKind::NewContext => "new-context",
            StageKind::GetFeatures => "get-features",
            StageKind::GetSequence => "get-sequence",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Requests
// =============================================================================

/// A request dispatched to one worker for one stage.
#[derive(Debug, Clone)]
pub struct Request {
    pub stage: StageKind,
    pub payload: RequestPayload,
}

/// Per-stage request payloads. Later stages are filled in from state
/// accumulated by earlier replies, which is why dispatch is deferred until
/// the previous stage has resolved.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Create {
        format: Option<String>,
        timeout_secs: Option<u64>,
        version: Option<String>,
    },
    Open {
        region: Region,
    },
    GetServerInfo,
    GetFeatureSets {
        /// Feature-set filter from the descriptor; empty means "everything".
        filter: Vec<String>,
    },
    GetStyles {
        /// Style names the feature-sets reply said this source needs.
        names: Vec<String>,
    },
    NewContext {
        region: Region,
    },
    GetFeatures {
        feature_sets: Vec<String>,
    },
    GetSequence,
}

impl RequestPayload {
    pub fn stage(&self) -> StageKind {
        match self {
            RequestPayload::Create { .. } => StageKind::Create,
            RequestPayload::Open { .. } => StageKind::Open,
            RequestPayload::GetServerInfo => StageKind::GetServerInfo,
            RequestPayload::GetFeatureSets { .. } => StageKind::GetFeatureSets,
            RequestPayload::GetStyles { .. } => StageKind::GetStyles,
            RequestPayload::NewContext { .. } => StageKind::NewContext,
            RequestPayload::GetFeatures { .. } => StageKind::GetFeatures,
            RequestPayload::GetSequence => StageKind::GetSequence,
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// What a worker knows about its source after `GetServerInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub program: String,
    pub version: String,
    pub database: Option<String>,
}

/// Per-stage reply payloads.
#[derive(Debug, Clone)]
pub enum ReplyPayload {
    Created {
        /// Opaque session tag the worker may hand back.
        session: String,
    },
    Opened,
    ServerInfo(ServerInfo),
    FeatureSets {
        /// Feature sets the source will actually serve.
        names: Vec<String>,
        /// Styles those sets need that the view may not have yet.
        required_styles: Vec<String>,
    },
    Styles(StyleSet),
    ContextReady,
    Features(FeatureContext),
    Sequence {
        dna: Bytes,
    },
}

/// One reply deposited by a worker. Exactly one per executed request, plus
/// the two out-of-band terminals (`Died`, `Cancelled`).
#[derive(Debug, Clone)]
pub enum Reply {
    /// The request succeeded.
    GotData {
        stage: StageKind,
        payload: ReplyPayload,
    },
    /// The request failed; the connection itself is still alive. What
    /// happens next is governed by the view's fail policy.
    RequestError { stage: StageKind, message: String },
    /// The worker is gone for good; fatal for this source only.
    Died { message: String },
    /// The worker confirmed a kill. This is the only path by which a killed
    /// connection is actually freed.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_pipeline_order() {
        let full = StageKind::FULL;
        assert_eq!(full[0], StageKind::Create);
        assert_eq!(full[full.len() - 1], StageKind::GetSequence);
        // Canonical order is strictly increasing.
        assert!(full.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_incremental_pipeline_skips_session_setup() {
        assert!(!StageKind::INCREMENTAL.contains(&StageKind::Create));
        assert!(!StageKind::INCREMENTAL.contains(&StageKind::Open));
        assert!(StageKind::INCREMENTAL.contains(&StageKind::GetFeatures));
    }

    #[test]
    fn test_payload_stage_round_trip() {
        let payload = RequestPayload::GetStyles {
            names: vec!["gene".to_string()],
        };
        assert_eq!(payload.stage(), StageKind::GetStyles);
        assert_eq!(payload.stage().label(), "get-styles");
    }
}
