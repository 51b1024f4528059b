// Copyright 2021 Joyent, Inc.

//! The switchboard classifies every inbound frame and either terminates it
//! locally, hands it to a registered handler, relays it onward, or bounces a
//! synthesized error reply toward its source. Rules are applied in order and
//! the first one that matches finishes the frame.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use slog::{debug, warn};

use crate::conn::{send_frame, Connection};
use crate::error::{BAD_TAG_MSG, CLOSED_MSG, FAIL_MSG};
use crate::node::Core;
use crate::protocol::PatchMessage;
use crate::register::Handler;

/// Handles one frame received on `origin`.
///
/// Boxed explicitly: `bounce` calls back into `dispatch` for loopback
/// replies, and that recursion keeps a plain `async fn` from inferring a
/// `Send` future on its own.
pub(crate) fn dispatch(
    core: Arc<Core>,
    msg: PatchMessage,
    origin: Arc<Connection>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if msg.tag == 0 {
            announce(&core, msg, &origin).await;
            return;
        }

        learn_return_path(&core, &msg, &origin);

        // A probe for work already in progress has served its purpose.
        if msg.tag < 0 && core.busy_holds(msg.tag.wrapping_neg()) {
            return;
        }

        if msg.dst == core.addr {
            complete_call(&core, msg);
            return;
        }

        if let Some(dest) = core.routes.find(&msg.dst) {
            if let Some(handler) = dest.handler.clone() {
                invoke_local(&core, handler, msg, origin).await;
            } else {
                relay(&core, &dest, msg, &origin).await;
            }
            return;
        }

        if let Some(uplink) = core.uplink() {
            // Never send a message back out the connection it arrived on; an
            // uplink that cannot route it has no better idea the second
            // time.
            if !uplink.is_closed() && !Arc::ptr_eq(&uplink, &origin) {
                relay(&core, &uplink, msg, &origin).await;
                return;
            }
        }

        dead_end(&core, msg, &origin).await;
    })
}

/// Rule 1: a `tag == 0` frame advertises that the name in `src` is reachable
/// via the connection it arrived on. The broker passes announcements from
/// its downlinks up toward its own uplink, if it has one.
async fn announce(
    core: &Arc<Core>,
    msg: PatchMessage,
    origin: &Arc<Connection>,
) {
    if msg.src.is_empty() || msg.src == core.addr {
        // A peer bounced this node's own address back; nothing to learn.
        return;
    }

    core.add_route(&msg.src, origin);

    if let Some(uplink) = core.uplink() {
        if !Arc::ptr_eq(&uplink, origin) {
            if let Err(e) = send_frame(core, &uplink, &msg).await {
                debug!(core.log(), "announcement forward failed";
                       "name" => %msg.src, "err" => %e);
            }
        }
    }
}

/// Remembers how to reach a sender this node has not heard from before, so
/// replies can travel the request's path backwards.
fn learn_return_path(
    core: &Core,
    msg: &PatchMessage,
    origin: &Arc<Connection>,
) {
    if !msg.err.is_empty()
        || msg.src.is_empty()
        || msg.src == core.addr
        || origin.is_loopback()
        || core.is_uplink(origin)
    {
        return;
    }
    if core.routes.find(&msg.src).is_none() {
        core.add_route(&msg.src, origin);
    }
}

/// Rule 3: a message addressed to this node is a reply to a call placed
/// here. Anything without a matching pending entry is expired traffic and
/// stops here; re-forwarding it would bounce between this node and its
/// broker until one of them dies.
fn complete_call(core: &Core, msg: PatchMessage) {
    if msg.tag > 0 {
        if let Err(stray) = core.pending.complete(msg.tag, msg) {
            debug!(core.log(), "dropping stray reply";
                   "src" => %stray.src, "tag" => stray.tag);
        }
        return;
    }
    debug!(core.log(), "dropping probe addressed to this node";
           "src" => %msg.src, "tag" => msg.tag);
}

/// Rule 4, local side: run the registered handler for `msg` in its own task
/// and send its reply back where the request came from. A tag already in the
/// busy set means a second caller picked the same tag; it is told to retry.
async fn invoke_local(
    core: &Arc<Core>,
    handler: Handler,
    msg: PatchMessage,
    origin: Arc<Connection>,
) {
    if !msg.err.is_empty() {
        // An error reply addressed to a local name has no caller to reach.
        warn!(core.log(), "dropping undeliverable error";
              "dst" => %msg.dst, "err" => %msg.err);
        return;
    }

    // Probes for idle tags fall through to a fresh execution; the tag goes
    // back to its positive form so the reply completes the original call.
    let tag = msg.tag.wrapping_abs();

    if !core.busy_insert(tag) {
        bounce(core, msg.into_error_reply(BAD_TAG_MSG), &origin).await;
        return;
    }

    let core = core.clone();
    tokio::spawn(async move {
        let va1 = msg.va1.clone();
        let va2 = msg.va2.clone();
        let outcome =
            tokio::task::spawn_blocking(move || handler(&va1, &va2)).await;

        let mut reply = PatchMessage {
            dst: msg.src,
            src: msg.dst,
            err: String::new(),
            tag,
            va1: String::new(),
            va2: String::new(),
        };
        match outcome {
            Ok(Ok(va2)) => reply.va2 = va2,
            Ok(Err(err)) => reply.err = err,
            Err(_) => reply.err = String::from("handler panicked"),
        }

        bounce(&core, reply, &origin).await;
        core.busy_remove(tag);
    });
}

/// Rule 4, remote side: pass the message along unchanged. A failed write on
/// an error-free message tells the original sender its peer is gone; a
/// failed write on a message already in error has nobody left to inform.
async fn relay(
    core: &Arc<Core>,
    dest: &Arc<Connection>,
    msg: PatchMessage,
    origin: &Arc<Connection>,
) {
    match send_frame(core, dest, &msg).await {
        Ok(()) => {}
        Err(e) if !msg.err.is_empty() => {
            debug!(core.log(), "error reply lost with its connection";
                   "dst" => %msg.dst, "err" => %e);
        }
        Err(e) => {
            debug!(core.log(), "relay failed";
                   "dst" => %msg.dst, "err" => %e);
            bounce(core, msg.into_error_reply(CLOSED_MSG), origin).await;
        }
    }
}

/// Rule 5: nobody can take this message. An error-free message turns into
/// the distinguished failure reply for its sender; one already in error is
/// logged and dropped to stop bounce loops.
async fn dead_end(
    core: &Arc<Core>,
    msg: PatchMessage,
    origin: &Arc<Connection>,
) {
    if !msg.err.is_empty() {
        warn!(core.log(), "unroutable error dropped";
              "dst" => %msg.dst, "tag" => msg.tag, "err" => %msg.err);
        return;
    }
    bounce(core, msg.into_error_reply(FAIL_MSG), origin).await;
}

/// Delivers a reply to the connection the request arrived on. Loopback
/// origins re-enter the switchboard, which is how a local caller's replies
/// reach its request table.
async fn bounce(
    core: &Arc<Core>,
    reply: PatchMessage,
    to: &Arc<Connection>,
) {
    if to.is_loopback() {
        // Replies to loopback callers recurse into dispatch once.
        dispatch(core.clone(), reply, to.clone()).await;
        return;
    }
    if let Err(e) = send_frame(core, to, &reply).await {
        // The origin is gone too; the reply dies here.
        debug!(core.log(), "reply undeliverable";
               "dst" => %reply.dst, "err" => %e);
    }
}
