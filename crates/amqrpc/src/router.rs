// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reply router: drains the reply-queue consumer and resolves pending calls.
//!
//! One router task runs per established session. It exits when the consumer
//! reports closure or the event channel ends. Whether closure is an incident
//! or part of an orderly shutdown is decided by the client state at that
//! moment: a live client fails all pending calls, a stopping one does not
//! (those calls were already failed with [`Error::Shutdown`]).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::ClientState;
use crate::correlation::CorrelationId;
use crate::error::Error;
use crate::registry::CallRegistry;
use crate::transport::{ConsumerEvent, InboundMessage};

/// Everything the router needs besides the event stream.
pub(crate) struct RouterContext {
    pub registry: CallRegistry,
    pub state: Arc<Mutex<ClientState>>,
    pub log_unrouted: bool,
}

/// Spawn the router over one session's reply events.
pub(crate) fn spawn(
    mut events: mpsc::Receiver<ConsumerEvent>,
    ctx: RouterContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConsumerEvent::Delivery(message) => route(&ctx, message),
                ConsumerEvent::Closed { reason } => {
                    handle_closed(&ctx, &reason);
                    return;
                }
            }
        }
        // Channel ended without a Closed event: link torn down locally.
        log::debug!("[ROUTER] Reply stream ended");
    })
}

fn route(ctx: &RouterContext, message: InboundMessage) {
    let Some(raw_id) = message.correlation_id else {
        unmatched(ctx, "missing correlation id", "<none>");
        return;
    };

    match CorrelationId::parse(&raw_id) {
        Some(id) => {
            if ctx.registry.resolve(&id, message.payload) {
                log::trace!("[ROUTER] Routed reply {}", id);
            } else {
                // Late (caller timed out or cancelled), duplicate, or from a
                // previous session of this client.
                unmatched(ctx, "no pending call", &raw_id);
            }
        }
        None => unmatched(ctx, "malformed correlation id", &raw_id),
    }
}

fn unmatched(ctx: &RouterContext, why: &str, id: &str) {
    if ctx.log_unrouted {
        log::debug!("[ROUTER] Dropping unmatched reply ({}): '{}'", why, id);
    }
}

fn handle_closed(ctx: &RouterContext, reason: &str) {
    let mut state = ctx.state.lock();
    if *state == ClientState::Connected {
        *state = ClientState::Disconnected;
        drop(state);

        let failed = ctx
            .registry
            .fail_all(&Error::unavailable(format!("connection lost: {}", reason)));
        log::warn!(
            "[ROUTER] Connection lost ({}); failed {} pending calls",
            reason,
            failed
        );
    } else {
        log::debug!("[ROUTER] Reply consumer closed during shutdown ({})", reason);
    }
}
