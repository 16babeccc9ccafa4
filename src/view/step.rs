//! Ordered request pipeline shared by all connections of one load.
//!
//! A `StepList` holds the canonical stage order plus, per connection, the
//! current stage cursor and one request slot per stage. A connection's
//! request for stage *k+1* is only created after its stage-*k* request
//! resolved `GotData` (or a failure policy dropped the connection from the
//! remaining stages). `advance` is the only place requests are dispatched.
//!
//! Each stage runs a three-phase contract: *dispatch* builds the request
//! payload from the run's accumulated scratch (later stages depend on
//! earlier replies), *process* interprets the reply into the scratch, and
//! the slot's *release* frees the resolved request's bookkeeping.

use std::collections::BTreeMap;

use crate::context::{FeatureContext, Region, StyleSet};
use crate::protocol::{ReplyPayload, Request, ServerInfo, StageKind};

use super::connection::{Connection, ConnectionId, PendingState};
use super::stages;

/// What happens to a connection after one of its requests fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailPolicy {
    /// Log and move on; the source keeps progressing through later stages.
    #[default]
    Continue,
    /// Drop the source from the remainder of this step list only.
    CancelRequest,
    /// Kill the whole source.
    CancelThread,
}

/// Reply state of one request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Wait,
    GotData,
    RequestError,
    Died,
    Cancelled,
}

#[derive(Debug)]
struct RequestSlot {
    state: SlotState,
    dispatched: bool,
    /// Diagnostic retained until the slot is released.
    note: Option<String>,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            state: SlotState::Wait,
            dispatched: false,
            note: None,
        }
    }

    /// The free phase: drop whatever the resolved request still holds.
    fn release(&mut self) {
        self.note = None;
    }
}

#[derive(Debug)]
struct Step {
    stage: StageKind,
    slots: BTreeMap<ConnectionId, RequestSlot>,
}

/// Scratch a connection accumulates across the stages of one run. Owned by
/// the run, not the connection, so two runs never alias.
#[derive(Debug)]
pub struct RunScratch {
    /// Feature-set filter this run was asked for; empty means "everything".
    pub filter: Vec<String>,
    /// Sets the source said it will serve.
    pub feature_sets: Vec<String>,
    /// Styles the source said those sets need.
    pub required_styles: Vec<String>,
    /// Style subset this source returned.
    pub styles: StyleSet,
    /// In-progress feature fragment.
    pub fragment: Option<FeatureContext>,
    pub server_info: Option<ServerInfo>,
    /// Session tag handed back by the worker's create stage.
    pub session: Option<String>,
    /// This source's terminal stage for the run.
    pub terminal: StageKind,
}

impl RunScratch {
    pub fn new(filter: Vec<String>, terminal: StageKind) -> Self {
        Self {
            filter,
            feature_sets: Vec::new(),
            required_styles: Vec::new(),
            styles: StyleSet::new(),
            fragment: None,
            server_info: None,
            session: None,
            terminal,
        }
    }
}

#[derive(Debug)]
struct Participant {
    cursor: usize,
    dropped: bool,
    completed: bool,
}

/// Everything a connection contributes when it completes its terminal stage.
#[derive(Debug)]
pub struct TerminalLoad {
    pub fragment: FeatureContext,
    pub styles: StyleSet,
}

/// Outcome of processing one `GotData` reply.
#[derive(Debug)]
pub enum StepEvent {
    /// The connection advanced to its next stage.
    Progressed,
    /// A features or sequence reply produced data to merge. `terminal` is
    /// set when this was also the connection's last stage.
    MergeReady { load: TerminalLoad, terminal: bool },
    /// The connection finished a terminal stage that carries no data.
    Completed,
    /// Reply did not match the connection's current stage; ignored.
    Stale,
}

/// Report from one `advance` pass.
#[derive(Debug, Default)]
pub struct AdvanceReport {
    pub dispatched: usize,
    /// Connections whose worker was gone at dispatch time.
    pub dead: Vec<ConnectionId>,
}

#[derive(Debug)]
pub struct StepList {
    region: Region,
    stages: Vec<Step>,
    participants: BTreeMap<ConnectionId, Participant>,
    scratch: BTreeMap<ConnectionId, RunScratch>,
    policy: OnFailPolicy,
}

impl StepList {
    pub fn new(policy: OnFailPolicy, region: Region) -> Self {
        Self {
            region,
            stages: Vec::new(),
            participants: BTreeMap::new(),
            scratch: BTreeMap::new(),
            policy,
        }
    }

    /// Append a stage. Order is significant and fixed once dispatch starts.
    pub fn add_stage(&mut self, stage: StageKind) {
        debug_assert!(
            self.participants.is_empty(),
            "stages must be added before connections"
        );
        self.stages.push(Step {
            stage,
            slots: BTreeMap::new(),
        });
    }

    pub fn policy(&self) -> OnFailPolicy {
        self.policy
    }

    /// Register a connection for every stage up to and including its
    /// terminal stage.
    pub fn add_connection(&mut self, id: ConnectionId, scratch: RunScratch) {
        let terminal = scratch.terminal;
        for index in 0..self.stages.len() {
            let stage = self.stages[index].stage;
            if stage > terminal {
                break;
            }
            self.add_connection_request(id, stage);
        }
        self.participants.insert(
            id,
            Participant {
                cursor: 0,
                dropped: false,
                completed: false,
            },
        );
        self.scratch.insert(id, scratch);
    }

    /// Register one connection's request slot in one stage.
    fn add_connection_request(&mut self, id: ConnectionId, stage: StageKind) {
        if let Some(step) = self.stages.iter_mut().find(|s| s.stage == stage) {
            step.slots.insert(id, RequestSlot::new());
        }
    }

    /// Dispatch a request for every connection whose previous stage resolved
    /// `GotData` and whose current slot has not been dispatched yet. This is
    /// the only place requests are created.
    pub fn advance(&mut self, connections: &mut BTreeMap<ConnectionId, Connection>) -> AdvanceReport {
        let mut report = AdvanceReport::default();
        for (&id, participant) in &mut self.participants {
            if participant.dropped || participant.completed {
                continue;
            }
            let Some(conn) = connections.get_mut(&id) else {
                continue;
            };
            if conn.pending != PendingState::Wait {
                continue;
            }
            let Some(step) = self.stages.get_mut(participant.cursor) else {
                continue;
            };
            let Some(slot) = step.slots.get_mut(&id) else {
                continue;
            };
            if slot.dispatched {
                continue;
            }
            let scratch = self
                .scratch
                .get(&id)
                .expect("participant always has scratch");
            let payload = stages::dispatch(step.stage, &conn.descriptor, &self.region, scratch);
            let request = Request {
                stage: step.stage,
                payload,
            };
            tracing::debug!(url = %conn.url, stage = %step.stage, "dispatching request");
            slot.dispatched = true;
            if conn.execute(request) {
                report.dispatched += 1;
            } else {
                slot.state = SlotState::Died;
                report.dead.push(id);
            }
        }
        report
    }

    /// Interpret a `GotData` reply for a connection's current stage.
    ///
    /// Returns `Err` with a diagnostic when the payload does not fit the
    /// stage; the caller treats that like a request failure.
    pub fn process_got_data(
        &mut self,
        id: ConnectionId,
        stage: StageKind,
        payload: ReplyPayload,
    ) -> Result<StepEvent, String> {
        let Some(participant) = self.participants.get_mut(&id) else {
            return Ok(StepEvent::Stale);
        };
        let Some(step) = self.stages.get_mut(participant.cursor) else {
            return Ok(StepEvent::Stale);
        };
        if step.stage != stage || participant.dropped || participant.completed {
            return Ok(StepEvent::Stale);
        }
        let scratch = self
            .scratch
            .get_mut(&id)
            .expect("participant always has scratch");
        stages::process(stage, payload, scratch, &self.region)?;

        if let Some(slot) = step.slots.get_mut(&id) {
            slot.state = SlotState::GotData;
            slot.release();
        }
        participant.cursor += 1;

        let is_terminal = stage == scratch.terminal;
        if is_terminal {
            participant.completed = true;
        }
        // Features and sequence replies each trigger a canonical merge;
        // everything else only feeds the run's scratch.
        if matches!(stage, StageKind::GetFeatures | StageKind::GetSequence) {
            let fragment = scratch
                .fragment
                .take()
                .unwrap_or_else(|| FeatureContext::new(self.region.clone()));
            let styles = std::mem::take(&mut scratch.styles);
            return Ok(StepEvent::MergeReady {
                load: TerminalLoad { fragment, styles },
                terminal: is_terminal,
            });
        }
        if is_terminal {
            return Ok(StepEvent::Completed);
        }
        Ok(StepEvent::Progressed)
    }

    /// Record a request failure on the connection's current slot.
    pub fn record_request_error(&mut self, id: ConnectionId, stage: StageKind, message: &str) {
        if let Some(participant) = self.participants.get(&id) {
            if let Some(step) = self.stages.get_mut(participant.cursor) {
                if step.stage == stage {
                    if let Some(slot) = step.slots.get_mut(&id) {
                        slot.state = SlotState::RequestError;
                        slot.note = Some(message.to_string());
                    }
                }
            }
        }
    }

    /// `Continue` policy: move past the failed stage. Returns `true` when
    /// the skipped stage was the connection's terminal stage, i.e. the run
    /// is finished for this source (with nothing to merge).
    pub fn skip_failed(&mut self, id: ConnectionId) -> bool {
        let Some(participant) = self.participants.get_mut(&id) else {
            return false;
        };
        let Some(step) = self.stages.get_mut(participant.cursor) else {
            return false;
        };
        if let Some(slot) = step.slots.get_mut(&id) {
            slot.release();
        }
        let stage = step.stage;
        participant.cursor += 1;
        let terminal = self
            .scratch
            .get(&id)
            .map(|s| s.terminal)
            .unwrap_or(StageKind::GetFeatures);
        if stage == terminal {
            participant.completed = true;
            true
        } else {
            false
        }
    }

    /// `CancelRequest` policy: the connection stops progressing through this
    /// step list but is not destroyed.
    pub fn drop_connection(&mut self, id: ConnectionId) {
        if let Some(participant) = self.participants.get_mut(&id) {
            participant.dropped = true;
        }
    }

    /// Remove a connection entirely (it died or was cancelled).
    pub fn remove_connection(&mut self, id: ConnectionId) {
        self.participants.remove(&id);
        self.scratch.remove(&id);
        for step in &mut self.stages {
            step.slots.remove(&id);
        }
    }

    /// Diagnostic retained on the connection's current slot, if its last
    /// request failed and has not been released yet.
    pub fn last_error(&self, id: ConnectionId) -> Option<&str> {
        let participant = self.participants.get(&id)?;
        let step = self.stages.get(participant.cursor)?;
        let slot = step.slots.get(&id)?;
        if slot.state == SlotState::RequestError {
            slot.note.as_deref()
        } else {
            None
        }
    }

    /// The stage a connection is currently at, if it is still progressing.
    pub fn current_stage(&self, id: ConnectionId) -> Option<StageKind> {
        let participant = self.participants.get(&id)?;
        if participant.dropped || participant.completed {
            return None;
        }
        self.stages.get(participant.cursor).map(|s| s.stage)
    }

    /// True when every registered connection has either completed its
    /// terminal stage or been dropped - or when none remain at all.
    pub fn is_exhausted(&self) -> bool {
        self.participants
            .values()
            .all(|p| p.completed || p.dropped)
    }

    pub fn completed_count(&self) -> usize {
        self.participants.values().filter(|p| p.completed).count()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}
