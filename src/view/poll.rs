//! Cooperative poll loop.
//!
//! Driven by an external periodic trigger; never blocks. Each tick checks
//! every connection's worker for a deposited reply with a plain `try_recv`,
//! advances the active step list, and resolves the view-level state
//! transition. All view, connection, and step-list state is mutated here and
//! only here, so the orchestrator core carries no locks.

use std::time::Duration;

use crate::context::merge;
use crate::protocol::{Reply, StageKind};

use super::connection::{ConnectionId, PendingState};
use super::step::{OnFailPolicy, StepEvent, TerminalLoad};
use super::{View, ViewState};

impl View {
    /// One cooperative tick.
    ///
    /// Returns the keep-polling signal: callers stop invoking the tick once
    /// it returns `false`.
    pub fn poll(&mut self) -> bool {
        if self.destroyed {
            return false;
        }

        // One reply per connection per tick; anything further waits for the
        // next trigger.
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let reply = match self.connections.get(&id) {
                Some(conn) => conn.try_reply(),
                None => continue,
            };
            if let Some(reply) = reply {
                self.handle_reply(id, reply);
            }
        }

        // The busy flag clears once no connection has outstanding work.
        let outstanding = self
            .connections
            .values()
            .any(|c| c.pending == PendingState::Executing);
        if self.busy && !outstanding {
            self.busy = false;
        }

        if self.connections.is_empty() {
            self.resolve_without_connections();
        } else if !matches!(self.state, ViewState::Resetting | ViewState::Dying) {
            self.advance_active();
        }

        self.keep_polling()
    }

    // -------------------------------------------------------------------------
    // Reply handling
    // -------------------------------------------------------------------------

    fn handle_reply(&mut self, id: ConnectionId, reply: Reply) {
        match reply {
            Reply::GotData { stage, payload } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.pending = PendingState::Wait;
                }
                if matches!(self.state, ViewState::Resetting | ViewState::Dying) {
                    // Draining; the run was abandoned.
                    return;
                }
                let Some(list) = self.active.as_mut() else {
                    tracing::debug!(connection = id, stage = %stage, "reply with no active step list");
                    return;
                };
                match list.process_got_data(id, stage, payload) {
                    Ok(StepEvent::Progressed) => {}
                    Ok(StepEvent::MergeReady { load, terminal }) => {
                        self.apply_merge(id, load);
                        if terminal {
                            self.note_source_loaded(id);
                        }
                    }
                    Ok(StepEvent::Completed) => self.note_source_loaded(id),
                    Ok(StepEvent::Stale) => {
                        tracing::debug!(connection = id, stage = %stage, "stale reply ignored");
                    }
                    Err(message) => {
                        tracing::warn!(connection = id, stage = %stage, error = %message, "reply unusable");
                        self.stats.requests_failed += 1;
                        self.apply_fail_policy(id, stage, &message);
                    }
                }
            }
            Reply::RequestError { stage, message } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.pending = PendingState::Wait;
                }
                tracing::warn!(connection = id, stage = %stage, error = %message, "request failed");
                self.stats.requests_failed += 1;
                if matches!(self.state, ViewState::Resetting | ViewState::Dying) {
                    return;
                }
                if let Some(list) = self.active.as_mut() {
                    list.record_request_error(id, stage, &message);
                }
                self.apply_fail_policy(id, stage, &message);
            }
            Reply::Died { message } => {
                self.handle_source_death(id, &message);
            }
            Reply::Cancelled => {
                self.stats.connections_cancelled += 1;
                if let Some(list) = self.active.as_mut() {
                    list.remove_connection(id);
                }
                if let Some(conn) = self.connections.remove(&id) {
                    conn.destroy();
                }
            }
        }
    }

    /// Apply the run's failure policy to a connection whose request failed.
    fn apply_fail_policy(&mut self, id: ConnectionId, stage: StageKind, message: &str) {
        let Some(list) = self.active.as_mut() else {
            return;
        };
        match list.policy() {
            OnFailPolicy::Continue => {
                if list.skip_failed(id) {
                    // The failed stage was terminal: the run is over for
                    // this source, with nothing to merge.
                    self.note_source_loaded(id);
                }
            }
            OnFailPolicy::CancelRequest => {
                let note = list.last_error(id).unwrap_or(message).to_string();
                list.drop_connection(id);
                tracing::warn!(
                    connection = id,
                    stage = %stage,
                    error = %note,
                    "source dropped from the remainder of this load"
                );
            }
            OnFailPolicy::CancelThread => {
                list.drop_connection(id);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.kill();
                }
                tracing::warn!(connection = id, stage = %stage, "source killed after failure");
            }
        }
    }

    /// Merge one source's contribution into the canonical model and hand
    /// the diff to the consumer.
    fn apply_merge(&mut self, id: ConnectionId, load: TerminalLoad) {
        let added = self.styles.merge_preserving(&load.styles);
        if added > 0 {
            tracing::debug!(connection = id, added, "styles merged");
        }
        let had_dna = load.fragment.dna.is_some();
        match merge::merge(&mut self.canonical, &load.fragment) {
            Ok(diff) => {
                self.stats.fragments_merged += 1;
                self.stats.features_merged += diff.feature_count() as u64;
                if had_dna {
                    self.stats.dna_loaded += 1;
                }
                if !diff.is_empty() {
                    self.observer.on_diff_ready(&diff, &self.styles);
                }
            }
            Err(e) => {
                // Rejecting one source's fragment leaves the canonical model
                // and every other source untouched.
                self.stats.merges_rejected += 1;
                tracing::warn!(connection = id, error = %e, "fragment rejected");
            }
        }
    }

    fn note_source_loaded(&mut self, id: ConnectionId) {
        self.loaded_count += 1;
        tracing::debug!(
            connection = id,
            loaded = self.loaded_count,
            total = self.connections.len(),
            "source finished its pipeline"
        );
    }

    /// A worker died: fatal for that source only, removed immediately.
    fn handle_source_death(&mut self, id: ConnectionId, message: &str) {
        self.stats.connections_died += 1;
        if let Some(list) = self.active.as_mut() {
            list.remove_connection(id);
        }
        if let Some(conn) = self.connections.remove(&id) {
            tracing::warn!(url = %conn.url, error = %message, "source died");
            conn.destroy();
        }
    }

    // -------------------------------------------------------------------------
    // Step-list advance / teardown
    // -------------------------------------------------------------------------

    fn advance_active(&mut self) {
        if self.active.as_ref().is_some_and(|l| l.is_exhausted()) {
            self.finish_run();
            return;
        }
        let Some(list) = self.active.as_mut() else {
            return;
        };
        let report = list.advance(&mut self.connections);
        if report.dispatched > 0 {
            self.busy = true;
            if self.state == ViewState::Connecting {
                self.set_state(ViewState::Loading);
            }
        }
        for id in report.dead {
            self.handle_source_death(id, "worker unavailable at dispatch");
        }
        if self.connections.is_empty() {
            self.resolve_without_connections();
            return;
        }
        if self.active.as_ref().is_some_and(|l| l.is_exhausted()) {
            self.finish_run();
        }
    }

    /// Tear down an exhausted step list and resolve the load-level outcome.
    fn finish_run(&mut self) {
        let Some(list) = self.active.take() else {
            return;
        };
        let completed = list.completed_count();
        tracing::info!(
            loaded = self.loaded_count,
            connections = self.connections.len(),
            "load run finished"
        );
        if matches!(self.state, ViewState::Connecting | ViewState::Loading) {
            if completed > 0 && !self.connections.is_empty() {
                self.set_state(ViewState::Loaded);
            } else {
                // Every participant was dropped by policy before reaching
                // its terminal stage. Reported once, not per source.
                self.observer
                    .on_load_failed("no source completed the load");
            }
        }
    }

    /// With no connections left, resolve the view-level transition.
    fn resolve_without_connections(&mut self) {
        match self.state {
            ViewState::Connecting | ViewState::Loading => {
                // Every source died mid-load. The session stays reusable
                // with the same region and configuration.
                self.active = None;
                self.loaded_count = 0;
                self.busy = false;
                self.observer
                    .on_load_failed("every source died while loading");
                self.set_state(ViewState::Init);
            }
            ViewState::Resetting => {
                self.busy = false;
                self.set_state(ViewState::Init);
            }
            ViewState::Dying => {
                self.finalize_destroy();
            }
            ViewState::Init | ViewState::Loaded => {}
        }
    }

    fn keep_polling(&self) -> bool {
        if self.destroyed {
            return false;
        }
        if matches!(self.state, ViewState::Resetting | ViewState::Dying) {
            return !self.connections.is_empty();
        }
        self.active.is_some()
            || self.busy
            || self
                .connections
                .values()
                .any(|c| c.pending == PendingState::Executing || c.is_killed())
    }
}

/// Drive a view's poll tick on a fixed interval until it signals done.
///
/// The tick itself never blocks; this helper only supplies the periodic
/// trigger. Embedders with their own event loop call [`View::poll`] from
/// their own timer instead.
pub async fn drive(view: &mut View, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !view.poll() {
            break;
        }
    }
}
