// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Router configuration space access for a Thunderbolt / USB4 domain.
//!
//! Routers form a tree rooted at the host router. Each [`RouterNode`] is
//! addressed by its [`Route`] and exposes reads and writes of its router,
//! adapter, path and counter configuration spaces, plus a walker for the
//! capability lists stored there.
//!
//! All routers of a domain share one control channel, the [`TbRing`]. The
//! hardware tags responses only by route, so each router keeps at most one
//! request in flight and queues the rest in FIFO order. Completions are fed
//! back by the ring through the [`FrameHandler`] registered when the root is
//! attached.
//!
//! [`TbRing`]: ring::TbRing
//! [`FrameHandler`]: ring::FrameHandler

#![forbid(unsafe_code)]

mod access;
pub mod caps;
mod command;
mod dispatch;
pub mod ring;
mod router;
mod scheduler;

#[cfg(test)]
mod test_helpers;

pub use router::RouterInfo;
pub use router::RouterNode;
pub use tb_spec::ConfigSpace;
pub use tb_spec::NotifyCode;
pub use tb_spec::Route;

use ring::RingError;
use std::time::Duration;
use thiserror::Error;

/// An error accessing a router.
#[derive(Debug, Error)]
pub enum Error {
    /// An allocation for a router or a request failed.
    #[error("out of memory")]
    NoMemory,
    /// The router still has queued or in-flight requests, or attached
    /// children.
    #[error("router is busy")]
    Busy,
    /// A route, hop, adapter, offset or length is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A router is already attached at the route.
    #[error("router already attached")]
    AlreadyExists,
    /// No router is attached at the route.
    #[error("no router at route {0}")]
    NotFound(Route),
    /// The request timed out on every attempt.
    #[error("request timed out")]
    TimedOut,
    /// A notification from the router aborted the request.
    #[error("protocol error: router reported {0:?}")]
    Notify(NotifyCode),
    /// The ring rejected the request.
    #[error("ring submission failed")]
    Ring(#[source] RingError),
    /// The router was detached or dropped before the request completed.
    #[error("router detached")]
    Detached,
}

/// Request parameters shared by every router of a domain.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Number of times a blocking or polled request is resent after timing
    /// out.
    pub retries: u32,
    /// How long a single attempt may take.
    pub timeout: Duration,
    /// How often polled requests check for completion.
    pub poll_interval: Duration,
}

impl DomainConfig {
    /// Sets the retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}
