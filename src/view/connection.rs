//! Orchestrator-side handle to one data source.

use url::Url;

use crate::config::{SourceDescriptor, SourceRoles};
use crate::context::Region;
use crate::protocol::{Reply, Request};
use crate::worker::{WorkerChannel, WorkerFactory};
use crate::{Result, ViewError};

pub type ConnectionId = u32;

/// Whether the connection's worker is between requests or executing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Wait,
    Executing,
}

/// One live source: its address, capabilities, and worker handle.
///
/// Per-run scratch state lives with the step-list run, not here, so an
/// initial load and a later incremental load never alias mutable state.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub url: Url,
    pub roles: SourceRoles,
    pub descriptor: SourceDescriptor,
    pub pending: PendingState,
    worker: WorkerChannel,
    killed: bool,
}

impl Connection {
    /// Parse the descriptor's URL and spin up its worker.
    pub fn open(
        id: ConnectionId,
        descriptor: SourceDescriptor,
        factory: &mut dyn WorkerFactory,
        region: &Region,
    ) -> Result<Self> {
        let url = descriptor.parse_url()?;
        let worker = factory
            .spawn(&descriptor, region)
            .map_err(|reason| ViewError::WorkerSpawn {
                url: descriptor.url.clone(),
                reason,
            })?;
        Ok(Self {
            id,
            url,
            roles: descriptor.roles(),
            descriptor,
            pending: PendingState::Wait,
            worker,
            killed: false,
        })
    }

    /// Hand a request to the worker. `false` means the worker is gone and
    /// the caller should treat this source as dead.
    pub fn execute(&mut self, request: Request) -> bool {
        if self.worker.execute(request) {
            self.pending = PendingState::Executing;
            true
        } else {
            false
        }
    }

    /// Non-blocking poll for the worker's next reply.
    pub fn try_reply(&self) -> Option<Reply> {
        self.worker.try_reply()
    }

    /// Fire-and-forget kill. The connection stays in the view until the
    /// worker confirms with `Cancelled`.
    pub fn kill(&mut self) {
        if !self.killed {
            self.killed = true;
            self.worker.kill();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Release the worker handle. Only called once the worker has confirmed
    /// termination or reported death.
    pub fn destroy(self) {
        tracing::debug!(url = %self.url, "connection destroyed");
        drop(self.worker);
    }
}
