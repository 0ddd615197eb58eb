// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ring completion handling: matches responses and notifications to the
//! router they came from.

use crate::Error;
use crate::command::CommandState;
use crate::ring::FrameHandler;
use crate::ring::TxFrame;
use crate::router::RouterNode;
use std::sync::Arc;
use std::sync::Weak;
use tb_spec::NotifyCode;
use tb_spec::Pdf;
use tb_spec::PlugEvent;
use tb_spec::Route;

pub(crate) struct Dispatcher {
    root: Weak<RouterNode>,
}

impl Dispatcher {
    pub fn new(root: Weak<RouterNode>) -> Self {
        Self { root }
    }

    fn lookup(&self, route: Route) -> Option<Arc<RouterNode>> {
        let root = self.root.upgrade()?;
        match root.lookup(route) {
            Ok(node) => Some(node),
            Err(err) => {
                tracelimit::warn_ratelimited!(
                    route = %route,
                    error = &err as &dyn std::error::Error,
                    "frame for unknown router"
                );
                None
            }
        }
    }

    fn rx_response(&self, pdf: Pdf, frame: &[u8]) {
        let (header, payload) = match tb_spec::parse_cfg_frame(frame) {
            Ok(r) => r,
            Err(err) => {
                tracelimit::warn_ratelimited!(
                    ?pdf,
                    error = &err as &dyn std::error::Error,
                    "dropping malformed response"
                );
                return;
            }
        };
        let route = header.route();
        let Some(node) = self.lookup(route) else {
            return;
        };
        let Some(cmd) = node.inflight() else {
            tracelimit::warn_ratelimited!(route = %route, ?pdf, "unexpected response");
            return;
        };

        let attrs = header.attrs();
        if cmd.pdf() != pdf || !cmd.attrs().same_target(&attrs) {
            tracelimit::warn_ratelimited!(
                route = %route,
                ?pdf,
                attrs = ?attrs,
                expected = ?cmd.attrs(),
                "response does not match request"
            );
            return;
        }
        let expected = cmd.response_dwords();
        if payload.len() != expected * 4 {
            tracelimit::warn_ratelimited!(
                route = %route,
                len = payload.len(),
                expected,
                "response has wrong length"
            );
            return;
        }

        tracing::trace!(route = %route, ?pdf, attrs = ?attrs, "config response");
        if let Some(response) = cmd.rx_done(tb_spec::payload_dwords(payload)) {
            node.finish(&cmd, CommandState::Completed, Ok(response));
        }
    }

    fn rx_notify(&self, frame: &[u8]) {
        let header = match tb_spec::parse_notify_frame(frame) {
            Ok(header) => header,
            Err(err) => {
                tracelimit::warn_ratelimited!(
                    error = &err as &dyn std::error::Error,
                    "dropping malformed notification"
                );
                return;
            }
        };
        let route = header.route();
        let event = header.event();
        let code = NotifyCode(event.code());
        let plug = PlugEvent(event.plug());

        if !code.aborts_transaction() {
            tracing::debug!(
                route = %route,
                ?code,
                adapter = event.adapter(),
                "notification"
            );
            return;
        }
        tracelimit::warn_ratelimited!(
            route = %route,
            ?code,
            adapter = event.adapter(),
            ?plug,
            "error notification"
        );

        let Some(node) = self.lookup(route) else {
            return;
        };
        if let Some(cmd) = node.inflight() {
            node.finish(&cmd, CommandState::NotifyError(code), Err(Error::Notify(code)));
        }
    }
}

impl FrameHandler for Dispatcher {
    fn tx_complete(&self, frame: &TxFrame) {
        let cmd = frame.command();
        if let Some(response) = cmd.tx_done() {
            if let Some(node) = cmd.node() {
                node.finish(cmd, CommandState::Completed, Ok(response));
            }
        }
    }

    fn rx_frame(&self, pdf: Pdf, frame: &[u8]) {
        match pdf {
            Pdf::READ | Pdf::WRITE => self.rx_response(pdf, frame),
            Pdf::NOTIFY => self.rx_notify(frame),
            _ => {
                tracelimit::warn_ratelimited!(?pdf, "frame with unknown pdf");
            }
        }
    }
}
