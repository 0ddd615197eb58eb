// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration space reads and writes.
//!
//! Blocking and polled requests are retried after a timeout, up to
//! [`DomainConfig::retries`] times. Asynchronous requests are sent once and
//! never time out on their own.
//!
//! A response that arrives after its attempt timed out and the request was
//! resent cannot be told apart from the response to the new attempt, since
//! the router echoes nothing but the route and address. It completes the new
//! attempt.
//!
//! [`DomainConfig::retries`]: crate::DomainConfig::retries

use crate::Error;
use crate::command::Command;
use crate::command::Outcome;
use crate::router::RouterNode;
use futures::channel::oneshot;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tb_spec::AddrAttrs;
use tb_spec::ConfigSpace;
use tb_spec::MAX_ADAPTER;
use tb_spec::MAX_DWORDS;
use tb_spec::MAX_OFFSET;

#[derive(Copy, Clone)]
enum Wait {
    Blocking,
    Polled,
}

fn request_attrs(
    space: ConfigSpace,
    adapter: u8,
    offset: u16,
    dwords: usize,
) -> Result<AddrAttrs, Error> {
    if dwords == 0 || dwords > MAX_DWORDS {
        return Err(Error::InvalidArgument("dword count out of range"));
    }
    if adapter > MAX_ADAPTER {
        return Err(Error::InvalidArgument("adapter out of range"));
    }
    if space.0 > ConfigSpace::COUNTERS.0 {
        return Err(Error::InvalidArgument("unknown config space"));
    }
    if usize::from(offset) + dwords > usize::from(MAX_OFFSET) + 1 {
        return Err(Error::InvalidArgument("offset out of range"));
    }
    Ok(AddrAttrs::new()
        .with_offset(offset)
        .with_size(dwords as u8)
        .with_adapter(adapter)
        .with_space(space.0))
}

impl RouterNode {
    /// Reads `dwords` dwords at `offset` of the given space, blocking until
    /// the response arrives.
    ///
    /// `adapter` selects the adapter for the adapter and path spaces and is
    /// ignored by the router space.
    pub fn read(
        self: &Arc<Self>,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        dwords: usize,
    ) -> Result<Vec<u32>, Error> {
        let attrs = request_attrs(space, adapter, offset, dwords)?;
        let cmd = Command::read(self, attrs, self.config().retries)?;
        self.run(cmd, Wait::Blocking)
    }

    /// Like [`RouterNode::read`], but polls the ring instead of waiting for
    /// a completion interrupt.
    pub fn read_polled(
        self: &Arc<Self>,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        dwords: usize,
    ) -> Result<Vec<u32>, Error> {
        let attrs = request_attrs(space, adapter, offset, dwords)?;
        let cmd = Command::read(self, attrs, self.config().retries)?;
        self.run(cmd, Wait::Polled)
    }

    /// Starts a read and returns immediately. `callback` runs exactly once,
    /// from the completion path, unless the router is dropped first.
    pub fn read_async<F>(
        self: &Arc<Self>,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        dwords: usize,
        callback: F,
    ) -> Result<(), Error>
    where
        F: 'static + Send + FnOnce(Result<Vec<u32>, Error>),
    {
        let attrs = request_attrs(space, adapter, offset, dwords)?;
        let cmd = Command::read(self, attrs, 0)?;
        cmd.set_callback(Box::new(callback));
        self.schedule(Some(cmd));
        Ok(())
    }

    /// Starts a read and returns a future for its result.
    ///
    /// The request is queued before this returns, whether or not the future
    /// is polled.
    pub fn read_future(
        self: &Arc<Self>,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        dwords: usize,
    ) -> impl Future<Output = Result<Vec<u32>, Error>> + Send + 'static {
        let (send, recv) = oneshot::channel();
        let started = self.read_async(space, adapter, offset, dwords, move |result| {
            let _ = send.send(result);
        });
        async move {
            started?;
            recv.await.map_err(|_| Error::Detached)?
        }
    }

    /// Writes `data` at `offset` of the given space, blocking until the
    /// router acknowledges it.
    pub fn write(
        self: &Arc<Self>,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        data: &[u32],
    ) -> Result<(), Error> {
        let attrs = request_attrs(space, adapter, offset, data.len())?;
        let cmd = Command::write(self, attrs, data, self.config().retries)?;
        self.run(cmd, Wait::Blocking).map(drop)
    }

    /// Like [`RouterNode::write`], but polls the ring instead of waiting for
    /// a completion interrupt.
    pub fn write_polled(
        self: &Arc<Self>,
        space: ConfigSpace,
        adapter: u8,
        offset: u16,
        data: &[u32],
    ) -> Result<(), Error> {
        let attrs = request_attrs(space, adapter, offset, data.len())?;
        let cmd = Command::write(self, attrs, data, self.config().retries)?;
        self.run(cmd, Wait::Polled).map(drop)
    }

    fn run(&self, cmd: Arc<Command>, wait: Wait) -> Outcome {
        loop {
            self.schedule(Some(cmd.clone()));
            // A timeout too large to represent waits forever.
            let deadline = Instant::now().checked_add(cmd.timeout());
            if let Some(outcome) = self.wait(&cmd, wait, deadline) {
                return outcome;
            }
            self.abandon(&cmd);
            if !cmd.rearm() {
                break;
            }
            tracing::debug!(
                route = %self.route(),
                attrs = ?cmd.attrs(),
                attempts = cmd.attempts(),
                "config request timed out, retrying"
            );
        }
        tracing::warn!(
            route = %self.route(),
            attrs = ?cmd.attrs(),
            attempts = cmd.attempts(),
            "config request timed out"
        );
        // Anything queued behind the abandoned command still needs sending.
        self.schedule(None);
        Err(Error::TimedOut)
    }

    /// Waits for `cmd` until `deadline`, waking every poll interval to poll
    /// the ring (for [`Wait::Polled`]) and to resend a command the ring
    /// refused as busy. Returns `None` once the command has been expired.
    fn wait(&self, cmd: &Command, wait: Wait, deadline: Option<Instant>) -> Option<Outcome> {
        let interval = self.config().poll_interval;
        loop {
            if matches!(wait, Wait::Polled) {
                self.ring().poll();
                if let Some(outcome) = cmd.try_outcome() {
                    return Some(outcome);
                }
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(deadline) if now >= deadline => return cmd.expire(),
                Some(deadline) => interval.min(deadline - now),
                None => interval,
            };
            match wait {
                Wait::Blocking => {
                    if let Some(outcome) = cmd.wait_for(slice) {
                        return Some(outcome);
                    }
                }
                Wait::Polled => std::thread::sleep(slice),
            }
            self.schedule(None);
        }
    }
}
