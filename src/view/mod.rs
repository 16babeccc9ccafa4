//! One browsing session: the view, its connections, and the session
//! state machine.
//!
//! A view owns the canonical feature model for one sequence region and one
//! connection per configured data source. Loading drives every connection
//! through a shared [`step::StepList`]; all state mutation happens inside
//! [`View::poll`] ticks, so the orchestrator needs no internal locking.
//!
//! ```text
//! Init -> Connecting -> Loading -> Loaded
//!   ^         |            |         |
//!   |         +--- all sources died -+      (fall back to Init, reusable)
//!   +---- Resetting <--- reset() ----+
//!                 any state -> Dying -> torn down
//! ```

pub mod connection;
mod poll;
mod stages;
pub mod step;

use std::collections::BTreeMap;

use crate::config::{SourceDescriptor, SourceRoles};
use crate::context::merge::MergeDiff;
use crate::context::{FeatureContext, Region, StyleSet};
use crate::error::{Result, ViewError};
use crate::protocol::StageKind;
use crate::worker::WorkerFactory;

pub use connection::{Connection, ConnectionId, PendingState};
pub use poll::drive;
pub use step::{OnFailPolicy, RunScratch, StepEvent, StepList, TerminalLoad};

// =============================================================================
// Session state
// =============================================================================

/// The session life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Init,
    Connecting,
    Loading,
    Loaded,
    Resetting,
    Dying,
}

impl std::fmt::Display for ViewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ViewState::Init => "init",
            ViewState::Connecting => "connecting",
            ViewState::Loading => "loading",
            ViewState::Loaded => "loaded",
            ViewState::Resetting => "resetting",
            ViewState::Dying => "dying",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Consumer contract
// =============================================================================

/// Callbacks into the rendering layer, injected at construction.
///
/// The view calls these from inside poll ticks; implementations must not
/// call back into the view.
pub trait ViewObserver {
    /// A merge produced new or changed model content. A full-redraw diff
    /// means "draw everything", not "draw nothing".
    fn on_diff_ready(&mut self, diff: &MergeDiff, styles: &StyleSet);

    /// The session state machine moved.
    fn on_state_changed(&mut self, state: ViewState);

    /// A whole load attempt produced nothing; reported once, not per source.
    fn on_load_failed(&mut self, reason: &str);

    /// The view finished tearing down; no further callbacks will arrive.
    fn on_view_destroyed(&mut self);
}

// =============================================================================
// Load statistics
// =============================================================================

/// Counters accumulated over the view's lifetime.
#[derive(Debug, Default, Clone)]
pub struct LoadStats {
    pub connections_opened: u64,
    pub connections_died: u64,
    pub connections_cancelled: u64,
    pub requests_failed: u64,
    pub fragments_merged: u64,
    pub features_merged: u64,
    pub merges_rejected: u64,
    pub dna_loaded: u64,
}

// =============================================================================
// View
// =============================================================================

pub struct View {
    state: ViewState,
    region: Region,
    connections: BTreeMap<ConnectionId, Connection>,
    active: Option<StepList>,
    canonical: FeatureContext,
    styles: StyleSet,
    busy: bool,
    policy: OnFailPolicy,
    reverse_complemented: bool,
    loaded_count: usize,
    next_connection_id: ConnectionId,
    stats: LoadStats,
    observer: Box<dyn ViewObserver>,
    factory: Box<dyn WorkerFactory>,
    destroyed: bool,
}

impl View {
    /// Create a view over `region`. The observer receives diffs and state
    /// changes; the factory spawns one worker per accepted source.
    pub fn new(
        region: Region,
        observer: Box<dyn ViewObserver>,
        factory: Box<dyn WorkerFactory>,
    ) -> Result<Self> {
        region.validate()?;
        let canonical = FeatureContext::new(region.clone());
        Ok(Self {
            state: ViewState::Init,
            region,
            connections: BTreeMap::new(),
            active: None,
            canonical,
            styles: StyleSet::new(),
            busy: false,
            policy: OnFailPolicy::default(),
            reverse_complemented: false,
            loaded_count: 0,
            next_connection_id: 1,
            stats: LoadStats::default(),
            observer,
            factory,
            destroyed: false,
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// True while any connection has an outstanding request.
    pub fn busy(&self) -> bool {
        self.busy
    }

    /// Connections that completed their terminal stage in the current run.
    pub fn loaded_count(&self) -> usize {
        self.loaded_count
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn canonical(&self) -> &FeatureContext {
        &self.canonical
    }

    pub fn styles(&self) -> &StyleSet {
        &self.styles
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    pub fn is_reverse_complemented(&self) -> bool {
        self.reverse_complemented
    }

    pub fn has_active_load(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    // -------------------------------------------------------------------------
    // Connect
    // -------------------------------------------------------------------------

    /// Open one connection per usable descriptor and start the full load
    /// pipeline. Bad sources are skipped with a warning; only a total
    /// absence of usable sources fails.
    ///
    /// Returns the number of connections opened.
    pub fn connect(
        &mut self,
        descriptors: Vec<SourceDescriptor>,
        policy: OnFailPolicy,
        load_dna: bool,
    ) -> Result<usize> {
        if self.destroyed || self.state == ViewState::Dying {
            return Err(ViewError::ViewDying);
        }
        if self.active.is_some() {
            return Err(ViewError::AlreadyConnecting);
        }
        if self.state != ViewState::Init {
            return Err(ViewError::NotInInitState {
                state: self.state.to_string(),
            });
        }

        let mut opened: Vec<ConnectionId> = Vec::new();
        for descriptor in descriptors {
            let source = descriptor.url.clone();
            if self
                .connections
                .values()
                .any(|c| c.descriptor.url == source)
            {
                tracing::warn!(url = %source, "duplicate source skipped");
                continue;
            }
            let id = self.next_connection_id;
            match Connection::open(id, descriptor, self.factory.as_mut(), &self.region) {
                Ok(conn) => {
                    self.next_connection_id += 1;
                    self.connections.insert(id, conn);
                    opened.push(id);
                }
                Err(e) => {
                    tracing::warn!(url = %source, error = %e, "source skipped");
                }
            }
        }

        if opened.is_empty() {
            return Err(ViewError::NoSourcesConnected(
                "every configured source was rejected".to_string(),
            ));
        }

        let mut list = StepList::new(policy, self.region.clone());
        for stage in StageKind::FULL {
            list.add_stage(stage);
        }
        for id in &opened {
            let conn = &self.connections[id];
            let terminal = self.terminal_stage(conn.roles, load_dna);
            let scratch = RunScratch::new(conn.descriptor.feature_sets.clone(), terminal);
            list.add_connection(*id, scratch);
        }

        self.stats.connections_opened += opened.len() as u64;
        self.policy = policy;
        self.loaded_count = 0;
        self.active = Some(list);
        self.set_state(ViewState::Connecting);
        tracing::info!(
            sources = opened.len(),
            region = %self.region.sequence_name,
            "connecting"
        );
        Ok(opened.len())
    }

    /// Incremental load over the already-open connections: fetch more
    /// feature sets (and optionally DNA) without re-opening anything.
    ///
    /// Starting a new run resets `loaded_count`; the view drops back to
    /// Loading until every surviving connection completes the new run.
    pub fn request_features(&mut self, feature_sets: Vec<String>, load_dna: bool) -> Result<()> {
        if self.destroyed || self.state == ViewState::Dying {
            return Err(ViewError::ViewDying);
        }
        if self.active.is_some() {
            return Err(ViewError::AlreadyConnecting);
        }
        if self.state != ViewState::Loaded {
            return Err(ViewError::NotLoaded {
                state: self.state.to_string(),
            });
        }
        if self.connections.is_empty() {
            return Err(ViewError::NoSourcesConnected(
                "no connections survive".to_string(),
            ));
        }

        let mut list = StepList::new(self.policy, self.region.clone());
        for stage in StageKind::INCREMENTAL {
            list.add_stage(stage);
        }
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let conn = &self.connections[&id];
            let terminal = self.terminal_stage(conn.roles, load_dna);
            list.add_connection(id, RunScratch::new(feature_sets.clone(), terminal));
        }

        self.loaded_count = 0;
        self.active = Some(list);
        self.set_state(ViewState::Loading);
        Ok(())
    }

    fn terminal_stage(&self, roles: SourceRoles, load_dna: bool) -> StageKind {
        if load_dna && roles.contains(SourceRoles::SEQUENCE) {
            StageKind::GetSequence
        } else {
            StageKind::GetFeatures
        }
    }

    // -------------------------------------------------------------------------
    // Reset / destroy
    // -------------------------------------------------------------------------

    /// Abort whatever is in flight, kill every connection, and blank the
    /// model. The view returns to Init once every worker confirms.
    pub fn reset(&mut self) -> Result<()> {
        if self.destroyed || self.state == ViewState::Dying {
            return Err(ViewError::ViewDying);
        }
        if self.state == ViewState::Init && self.connections.is_empty() {
            return Ok(());
        }

        self.active = None;
        self.loaded_count = 0;
        self.canonical = FeatureContext::new(self.region.clone());
        self.styles = StyleSet::new();
        self.reverse_complemented = false;
        for conn in self.connections.values_mut() {
            conn.kill();
        }
        self.set_state(ViewState::Resetting);
        Ok(())
    }

    /// Begin teardown. With no connections the view is torn down at once;
    /// otherwise workers are killed and teardown completes asynchronously
    /// via `poll` as they confirm.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.active = None;
        self.set_state(ViewState::Dying);
        if self.connections.is_empty() {
            self.finalize_destroy();
        } else {
            for conn in self.connections.values_mut() {
                conn.kill();
            }
        }
    }

    fn finalize_destroy(&mut self) {
        self.destroyed = true;
        self.busy = false;
        self.observer.on_view_destroyed();
        tracing::info!(region = %self.region.sequence_name, "view destroyed");
    }

    // -------------------------------------------------------------------------
    // Reverse complement
    // -------------------------------------------------------------------------

    /// Flip the canonical model's coordinate frame and hand the consumer a
    /// full-redraw diff. Not legal while a load is in flight.
    pub fn toggle_reverse_complement(&mut self) -> Result<()> {
        if self.destroyed || self.state == ViewState::Dying {
            return Err(ViewError::ViewDying);
        }
        if self.active.is_some() || self.busy {
            return Err(ViewError::AlreadyConnecting);
        }
        self.canonical.reverse_complement()?;
        self.reverse_complemented = !self.reverse_complemented;
        let diff = MergeDiff::full(self.canonical.clone());
        self.observer.on_diff_ready(&diff, &self.styles);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shared internals (used by the poll loop)
    // -------------------------------------------------------------------------

    pub(crate) fn set_state(&mut self, state: ViewState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "view state");
            self.state = state;
            self.observer.on_state_changed(state);
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("state", &self.state)
            .field("region", &self.region)
            .field("connections", &self.connections.len())
            .field("loaded_count", &self.loaded_count)
            .field("busy", &self.busy)
            .finish()
    }
}
