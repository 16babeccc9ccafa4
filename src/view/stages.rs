//! Per-stage dispatch and process handlers.
//!
//! Every stage follows the same three-phase contract: *dispatch* fills in a
//! request payload from the run's scratch (later stages depend on earlier
//! results), *process* interprets the reply back into the scratch, and the
//! request slot's release in [`super::step`] frees what is left. The tables
//! here are keyed by [`StageKind`]; adding a stage means adding one arm to
//! each.

use crate::config::SourceDescriptor;
use crate::context::{FeatureContext, Region};
use crate::protocol::{ReplyPayload, RequestPayload, StageKind};

use super::step::RunScratch;

/// Build the request payload for `stage` from the connection's descriptor
/// and the run's accumulated scratch.
pub(super) fn dispatch(
    stage: StageKind,
    descriptor: &SourceDescriptor,
    region: &Region,
    scratch: &RunScratch,
) -> RequestPayload {
    match stage {
        StageKind::Create => RequestPayload::Create {
            format: descriptor.format.clone(),
            timeout_secs: descriptor.timeout_secs,
            version: descriptor.version.clone(),
        },
        StageKind::Open => RequestPayload::Open {
            region: region.clone(),
        },
        StageKind::GetServerInfo => RequestPayload::GetServerInfo,
        StageKind::GetFeatureSets => RequestPayload::GetFeatureSets {
            filter: scratch.filter.clone(),
        },
        StageKind::GetStyles => {
            // The source's own requirements plus whatever the descriptor
            // asked for up front, deduplicated, order preserved.
            let mut names = scratch.required_styles.clone();
            for style in &descriptor.styles {
                if !names.contains(style) {
                    names.push(style.clone());
                }
            }
            RequestPayload::GetStyles { names }
        }
        StageKind::NewContext => RequestPayload::NewContext {
            region: region.clone(),
        },
        StageKind::GetFeatures => {
            let feature_sets = if scratch.feature_sets.is_empty() {
                scratch.filter.clone()
            } else {
                scratch.feature_sets.clone()
            };
            RequestPayload::GetFeatures { feature_sets }
        }
        StageKind::GetSequence => RequestPayload::GetSequence,
    }
}

/// Interpret a reply for `stage`, updating the run's scratch.
///
/// A payload that does not fit the stage is a protocol violation by the
/// worker; the caller treats the returned diagnostic like a request failure.
pub(super) fn process(
    stage: StageKind,
    payload: ReplyPayload,
    scratch: &mut RunScratch,
    region: &Region,
) -> Result<(), String> {
    match (stage, payload) {
        (StageKind::Create, ReplyPayload::Created { session }) => {
            scratch.session = Some(session);
            Ok(())
        }
        (StageKind::Open, ReplyPayload::Opened) => Ok(()),
        (StageKind::GetServerInfo, ReplyPayload::ServerInfo(info)) => {
            tracing::debug!(program = %info.program, version = %info.version, "server info");
            scratch.server_info = Some(info);
            Ok(())
        }
        (
            StageKind::GetFeatureSets,
            ReplyPayload::FeatureSets {
                names,
                required_styles,
            },
        ) => {
            scratch.feature_sets = names;
            scratch.required_styles = required_styles;
            Ok(())
        }
        (StageKind::GetStyles, ReplyPayload::Styles(styles)) => {
            scratch.styles = styles;
            Ok(())
        }
        (StageKind::NewContext, ReplyPayload::ContextReady) => Ok(()),
        (StageKind::GetFeatures, ReplyPayload::Features(fragment)) => {
            scratch.fragment = Some(fragment);
            Ok(())
        }
        (StageKind::GetSequence, ReplyPayload::Sequence { dna }) => {
            // DNA rides on the fragment the features stage produced; a
            // source serving only sequence still yields a mergeable fragment.
            scratch
                .fragment
                .get_or_insert_with(|| FeatureContext::new(region.clone()))
                .dna = Some(dna);
            Ok(())
        }
        (stage, payload) => Err(format!(
            "worker returned a payload that does not fit the {stage} stage: {payload:?}"
        )),
    }
}
