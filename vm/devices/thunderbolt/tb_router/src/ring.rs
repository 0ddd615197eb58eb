// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control channel shared by all routers of a domain.

use crate::command::Command;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use tb_spec::Pdf;
use tb_spec::Route;
use thiserror::Error;

/// An error submitting a frame to the ring.
#[derive(Debug, Error)]
pub enum RingError {
    /// The ring has no free transmit slot. The frame can be resubmitted
    /// later.
    #[error("ring is full")]
    Busy,
    /// The ring failed to queue the frame.
    #[error("ring i/o error")]
    Io(#[source] std::io::Error),
}

/// Transmit/receive ring for control frames.
///
/// Implemented by the host interface driver. Frames are handed over by value
/// and returned by reference to [`FrameHandler::tx_complete`] once sent.
pub trait TbRing: Send + Sync {
    /// Queues `frame` for transmission.
    fn submit(&self, frame: TxFrame) -> Result<(), RingError>;

    /// Routes received frames with the given PDF, and transmit completions
    /// of frames with that PDF, to `handler`.
    fn register_handler(&self, pdf: Pdf, handler: Weak<dyn FrameHandler>);

    /// Processes pending completions without waiting for an interrupt.
    fn poll(&self) {}
}

/// Receives ring completions.
pub trait FrameHandler: Send + Sync {
    /// Called once `frame` has been put on the wire.
    fn tx_complete(&self, frame: &TxFrame);

    /// Called for each received frame. `frame` includes the CRC trailer.
    fn rx_frame(&self, pdf: Pdf, frame: &[u8]);
}

/// A request frame bound to the command that produced it.
pub struct TxFrame {
    pdf: Pdf,
    route: Route,
    data: Vec<u8>,
    command: Arc<Command>,
}

impl TxFrame {
    pub(crate) fn new(command: Arc<Command>) -> Self {
        Self {
            pdf: command.pdf(),
            route: command.route(),
            data: command.frame().to_vec(),
            command,
        }
    }

    /// The frame class.
    pub fn pdf(&self) -> Pdf {
        self.pdf
    }

    /// The destination router.
    pub fn route(&self) -> Route {
        self.route
    }

    /// The serialized frame, CRC trailer included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn command(&self) -> &Arc<Command> {
        &self.command
    }
}

impl fmt::Debug for TxFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxFrame")
            .field("pdf", &self.pdf)
            .field("route", &self.route)
            .field("len", &self.data.len())
            .finish()
    }
}
