// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration requests and their completion state.

use crate::Error;
use crate::router::RouterNode;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tb_spec::AddrAttrs;
use tb_spec::CfgHeader;
use tb_spec::NotifyCode;
use tb_spec::Pdf;
use tb_spec::Route;

/// The result handed to waiters and callbacks. Writes complete with an empty
/// vector.
pub(crate) type Outcome = Result<Vec<u32>, Error>;

pub(crate) type Callback = Box<dyn FnOnce(Outcome) + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CommandState {
    Queued,
    Dispatched,
    Completed,
    TimedOut,
    NotifyError(NotifyCode),
    Failed,
}

impl CommandState {
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Dispatched)
    }
}

struct Status {
    state: CommandState,
    tx_done: bool,
    rx_done: bool,
    response: Vec<u32>,
    outcome: Option<Outcome>,
    callback: Option<Callback>,
    retries_left: u32,
    attempts: u32,
}

/// A single read or write of a router's configuration space.
///
/// A command moves from `Queued` to `Dispatched` when its frame is handed
/// to the ring, and is complete once both the transmit completion and the
/// response have been seen, or once a notification or submission failure
/// ends it early. A timed-out command can be rearmed and sent again.
pub(crate) struct Command {
    node: Weak<RouterNode>,
    route: Route,
    pdf: Pdf,
    attrs: AddrAttrs,
    frame: Vec<u8>,
    timeout: Duration,
    status: Mutex<Status>,
    done: Condvar,
}

impl Command {
    fn new(
        node: &Arc<RouterNode>,
        pdf: Pdf,
        attrs: AddrAttrs,
        data: &[u32],
        retries: u32,
    ) -> Result<Arc<Self>, Error> {
        let route = node.route();
        let frame = tb_spec::build_frame(&CfgHeader::new(route, attrs), data);
        let mut response = Vec::new();
        if pdf == Pdf::READ {
            response
                .try_reserve_exact(attrs.size().into())
                .map_err(|_| Error::NoMemory)?;
        }
        Ok(Arc::new(Self {
            node: Arc::downgrade(node),
            route,
            pdf,
            attrs,
            frame,
            timeout: node.config().timeout,
            status: Mutex::new(Status {
                state: CommandState::Queued,
                tx_done: false,
                rx_done: false,
                response,
                outcome: None,
                callback: None,
                retries_left: retries,
                attempts: 0,
            }),
            done: Condvar::new(),
        }))
    }

    pub fn read(
        node: &Arc<RouterNode>,
        attrs: AddrAttrs,
        retries: u32,
    ) -> Result<Arc<Self>, Error> {
        Self::new(node, Pdf::READ, attrs, &[], retries)
    }

    pub fn write(
        node: &Arc<RouterNode>,
        attrs: AddrAttrs,
        data: &[u32],
        retries: u32,
    ) -> Result<Arc<Self>, Error> {
        Self::new(node, Pdf::WRITE, attrs, data, retries)
    }

    pub fn node(&self) -> Option<Arc<RouterNode>> {
        self.node.upgrade()
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn pdf(&self) -> Pdf {
        self.pdf
    }

    pub fn attrs(&self) -> AddrAttrs {
        self.attrs
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Dword count expected in a read response.
    pub fn response_dwords(&self) -> usize {
        if self.pdf == Pdf::READ {
            self.attrs.size().into()
        } else {
            0
        }
    }

    pub fn state(&self) -> CommandState {
        self.status.lock().state
    }

    pub fn attempts(&self) -> u32 {
        self.status.lock().attempts
    }

    pub fn set_callback(&self, callback: Callback) {
        self.status.lock().callback = Some(callback);
    }

    /// Marks the command as handed to the ring. A command that timed out
    /// while queued stays timed out.
    pub fn dispatch(&self) {
        let mut status = self.status.lock();
        if status.state == CommandState::Queued {
            status.state = CommandState::Dispatched;
            status.attempts += 1;
        }
    }

    /// Returns a dispatched command to the queue after the ring refused it.
    pub fn undispatch(&self) {
        let mut status = self.status.lock();
        if status.state == CommandState::Dispatched {
            status.state = CommandState::Queued;
            status.attempts = status.attempts.saturating_sub(1);
        }
    }

    /// Records the transmit completion. Returns the response if the command
    /// is now ready to complete.
    pub fn tx_done(&self) -> Option<Vec<u32>> {
        let mut status = self.status.lock();
        if status.state != CommandState::Dispatched || status.tx_done {
            return None;
        }
        status.tx_done = true;
        if status.rx_done {
            Some(std::mem::take(&mut status.response))
        } else {
            None
        }
    }

    /// Records the response payload. Returns the response if the command is
    /// now ready to complete.
    pub fn rx_done(&self, payload: impl IntoIterator<Item = u32>) -> Option<Vec<u32>> {
        let mut status = self.status.lock();
        if status.state != CommandState::Dispatched || status.rx_done {
            return None;
        }
        status.rx_done = true;
        let count = self.response_dwords();
        status.response.clear();
        status.response.extend(payload.into_iter().take(count));
        if status.tx_done {
            Some(std::mem::take(&mut status.response))
        } else {
            None
        }
    }

    /// Completes the command and wakes its waiter or runs its callback.
    ///
    /// Returns false if the command had already finished.
    pub fn complete(&self, state: CommandState, outcome: Outcome) -> bool {
        debug_assert!(state.is_terminal());
        let callback = {
            let mut status = self.status.lock();
            if status.state.is_terminal() {
                return false;
            }
            status.state = state;
            match status.callback.take() {
                Some(callback) => Some((callback, outcome)),
                None => {
                    status.outcome = Some(outcome);
                    None
                }
            }
        };
        self.done.notify_all();
        if let Some((callback, outcome)) = callback {
            callback(outcome);
        }
        true
    }

    /// Takes the outcome if the command has completed.
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.status.lock().outcome.take()
    }

    /// Blocks until the command completes or `timeout` passes, and takes
    /// the outcome if there is one.
    pub fn wait_for(&self, timeout: Duration) -> Option<Outcome> {
        let mut status = self.status.lock();
        if status.outcome.is_none() {
            self.done.wait_for(&mut status, timeout);
        }
        status.outcome.take()
    }

    /// Marks the command timed out unless it completed in the meantime, in
    /// which case its outcome is returned.
    pub fn expire(&self) -> Option<Outcome> {
        let mut status = self.status.lock();
        if let Some(outcome) = status.outcome.take() {
            return Some(outcome);
        }
        status.state = CommandState::TimedOut;
        None
    }

    /// Prepares a timed-out command for another attempt. Returns false once
    /// the retry budget is spent.
    pub fn rearm(&self) -> bool {
        let mut status = self.status.lock();
        debug_assert_eq!(status.state, CommandState::TimedOut);
        if status.retries_left == 0 {
            return false;
        }
        status.retries_left -= 1;
        status.state = CommandState::Queued;
        status.tx_done = false;
        status.rx_done = false;
        status.response.clear();
        true
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("route", &self.route)
            .field("pdf", &self.pdf)
            .field("attrs", &self.attrs)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockRing;
    use crate::test_helpers::MockRouter;
    use crate::test_helpers::test_config;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn test_node() -> Arc<RouterNode> {
        let ring = MockRing::new();
        ring.add_router(Route::ROOT, MockRouter::new(4, 0));
        RouterNode::attach_root_with_config(ring, Route::ROOT, test_config()).unwrap()
    }

    fn attrs(size: u8) -> AddrAttrs {
        AddrAttrs::new().with_size(size).with_space(2)
    }

    #[test]
    fn test_complete_needs_tx_and_rx() {
        let node = test_node();
        let cmd = Command::read(&node, attrs(2), 0).unwrap();
        cmd.dispatch();
        assert!(cmd.rx_done([1, 2, 3]).is_none());
        assert_eq!(cmd.tx_done(), Some(vec![1, 2]));

        let cmd = Command::read(&node, attrs(1), 0).unwrap();
        cmd.dispatch();
        assert!(cmd.tx_done().is_none());
        assert!(cmd.tx_done().is_none());
        assert_eq!(cmd.rx_done([9]), Some(vec![9]));
    }

    #[test]
    fn test_completion_ignored_unless_dispatched() {
        let node = test_node();
        let cmd = Command::read(&node, attrs(1), 0).unwrap();
        assert!(cmd.tx_done().is_none());
        assert!(cmd.rx_done([1]).is_none());
        assert_eq!(cmd.state(), CommandState::Queued);
    }

    #[test]
    fn test_callback_fires_once() {
        let node = test_node();
        let cmd = Command::read(&node, attrs(1), 0).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        cmd.set_callback(Box::new({
            let fired = fired.clone();
            move |outcome| {
                assert_eq!(outcome.unwrap(), [5]);
                fired.fetch_add(1, Ordering::SeqCst);
            }
        }));
        cmd.dispatch();
        assert!(cmd.complete(CommandState::Completed, Ok(vec![5])));
        assert!(!cmd.complete(CommandState::Failed, Err(Error::Detached)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(cmd.try_outcome().is_none());
    }

    #[test]
    fn test_rearm_budget() {
        let node = test_node();
        let cmd = Command::read(&node, attrs(1), 1).unwrap();
        cmd.dispatch();
        assert!(cmd.expire().is_none());
        assert_eq!(cmd.state(), CommandState::TimedOut);
        assert!(cmd.rearm());
        assert_eq!(cmd.state(), CommandState::Queued);
        cmd.dispatch();
        assert_eq!(cmd.attempts(), 2);
        assert!(cmd.expire().is_none());
        assert!(!cmd.rearm());
    }

    #[test]
    fn test_late_completion_after_timeout_is_dropped() {
        let node = test_node();
        let cmd = Command::read(&node, attrs(1), 0).unwrap();
        cmd.dispatch();
        assert!(cmd.wait_for(Duration::from_millis(1)).is_none());
        assert!(cmd.expire().is_none());
        assert!(!cmd.complete(CommandState::Completed, Ok(vec![1])));
        assert!(cmd.tx_done().is_none());
    }
}
