// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-router request queue.
//!
//! Responses carry no tag beyond the route, so a router may only have one
//! request on the wire. Everything else waits in a FIFO queue and is sent
//! once the in-flight request completes.

use crate::Error;
use crate::command::Command;
use crate::command::CommandState;
use crate::ring::RingError;
use crate::ring::TxFrame;
use crate::router::RouterNode;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) enum Inflight {
    Idle,
    Busy(Arc<Command>),
}

impl Inflight {
    fn is(&self, cmd: &Arc<Command>) -> bool {
        matches!(self, Self::Busy(c) if Arc::ptr_eq(c, cmd))
    }
}

pub(crate) struct SchedState {
    queue: VecDeque<Arc<Command>>,
    inflight: Inflight,
}

impl SchedState {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            inflight: Inflight::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && matches!(self.inflight, Inflight::Idle)
    }
}

impl RouterNode {
    /// Appends `new` to the queue, if any, and sends queued commands until
    /// one is in flight. A command for a detached router fails at once.
    pub(crate) fn schedule(&self, new: Option<Arc<Command>>) {
        let mut sched = self.sched.lock();
        if let Some(cmd) = new {
            if self.is_detached() {
                drop(sched);
                cmd.complete(CommandState::Failed, Err(Error::Detached));
                return;
            }
            sched.queue.push_back(cmd);
        }
        loop {
            if !matches!(sched.inflight, Inflight::Idle) {
                break;
            }
            let Some(cmd) = sched.queue.pop_front() else {
                break;
            };
            sched.inflight = Inflight::Busy(cmd.clone());
            cmd.dispatch();
            drop(sched);

            let result = self.ring().submit(TxFrame::new(cmd.clone()));

            sched = self.sched.lock();
            match result {
                Ok(()) => {}
                Err(RingError::Busy) => {
                    tracing::trace!(route = %self.route(), "ring busy, requeueing");
                    cmd.undispatch();
                    if sched.inflight.is(&cmd) {
                        sched.inflight = Inflight::Idle;
                    }
                    sched.queue.push_front(cmd);
                    break;
                }
                Err(err) => {
                    if sched.inflight.is(&cmd) {
                        sched.inflight = Inflight::Idle;
                    }
                    drop(sched);
                    tracelimit::warn_ratelimited!(
                        route = %self.route(),
                        error = &err as &dyn std::error::Error,
                        "failed to submit config request"
                    );
                    cmd.complete(CommandState::Failed, Err(Error::Ring(err)));
                    sched = self.sched.lock();
                }
            }
        }
    }

    /// The command currently on the wire.
    pub(crate) fn inflight(&self) -> Option<Arc<Command>> {
        match &self.sched.lock().inflight {
            Inflight::Idle => None,
            Inflight::Busy(cmd) => Some(cmd.clone()),
        }
    }

    /// Completes `cmd`, frees the in-flight slot if it holds `cmd`, and sends
    /// the next queued command.
    pub(crate) fn finish(
        &self,
        cmd: &Arc<Command>,
        state: CommandState,
        outcome: Result<Vec<u32>, Error>,
    ) {
        {
            let mut sched = self.sched.lock();
            if sched.inflight.is(cmd) {
                sched.inflight = Inflight::Idle;
            }
        }
        cmd.complete(state, outcome);
        self.schedule(None);
    }

    /// Withdraws a timed-out command, from the in-flight slot or from the
    /// queue.
    pub(crate) fn abandon(&self, cmd: &Arc<Command>) {
        let mut sched = self.sched.lock();
        if sched.inflight.is(cmd) {
            sched.inflight = Inflight::Idle;
        } else {
            sched.queue.retain(|c| !Arc::ptr_eq(c, cmd));
        }
    }

    /// The number of commands waiting behind the in-flight one.
    pub fn queued(&self) -> usize {
        self.sched.lock().queue.len()
    }
}
