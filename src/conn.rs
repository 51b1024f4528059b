// Copyright 2021 Joyent, Inc.

//! A single switchboard connection. A connection is either one end of a
//! UNIX-domain socket (write half serialized behind a lock, one reader task
//! driving the decoder) or a loopback entry standing in for a locally
//! registered handler, which has no socket at all.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use slog::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;

use crate::error::Error;
use crate::node::Core;
use crate::protocol::{encode_msg, PatchCodec, PatchMessage};
use crate::register::Handler;
use crate::switchboard;

pub(crate) struct Connection {
    /// Short label used in log lines.
    pub(crate) label: String,
    /// Serializes writers; `None` once closed, and always `None` for
    /// loopback entries.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Set on loopback entries: delivering to this connection invokes the
    /// handler instead of writing to a socket.
    pub(crate) handler: Option<Handler>,
    /// Names announced over this connection, purged from the route table on
    /// close.
    pub(crate) routes: StdMutex<Vec<String>>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn socket(label: &str, writer: OwnedWriteHalf) -> Arc<Connection> {
        Arc::new(Connection {
            label: String::from(label),
            writer: Mutex::new(Some(writer)),
            handler: None,
            routes: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn loopback(name: &str, handler: Handler) -> Arc<Connection> {
        Arc::new(Connection {
            label: format!("local.{}", name),
            writer: Mutex::new(None),
            handler: Some(handler),
            routes: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes one encoded frame, serialized against concurrent senders.
    pub(crate) async fn write_frame(
        &self,
        msg: &PatchMessage,
    ) -> io::Result<()> {
        let mut buf = bytes::BytesMut::new();
        encode_msg(msg, &mut buf);

        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.write_all(&buf).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    /// Purges every route announced over this connection and drops the
    /// socket. Idempotent.
    pub(crate) async fn close(&self, core: &Core) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        core.routes.remove_all_for(self);
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }
}

/// Traces and writes one frame on `conn`.
pub(crate) async fn send_frame(
    core: &Core,
    conn: &Connection,
    msg: &PatchMessage,
) -> io::Result<()> {
    core.trace_frame("send", &conn.label, msg);
    conn.write_frame(msg).await
}

/// Drives one socket connection: announces this node's address and every
/// route it currently knows, then decodes frames and hands each to the
/// switchboard until EOF ([`Error::Closed`]) or a read failure. The
/// connection is closed on the way out no matter how the loop ends.
pub(crate) async fn run_reader(
    core: Arc<Core>,
    conn: Arc<Connection>,
    read_half: OwnedReadHalf,
) -> Result<(), Error> {
    let res = read_loop(&core, &conn, read_half).await;
    conn.close(&core).await;
    res
}

async fn read_loop(
    core: &Arc<Core>,
    conn: &Arc<Connection>,
    read_half: OwnedReadHalf,
) -> Result<(), Error> {
    // Startup burst: the peer learns this node's address and, transitively,
    // every name reachable through it.
    send_frame(core, conn, &PatchMessage::announcement(core.addr.clone()))
        .await?;
    for name in core.routes.names() {
        send_frame(core, conn, &PatchMessage::announcement(name)).await?;
    }

    let mut frames = FramedRead::new(read_half, PatchCodec);
    while let Some(frame) = frames.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed traffic is fatal for the offending connection.
                debug!(core.log(), "dropping connection";
                       "conn" => %conn.label, "err" => %e);
                return Err(Error::Io(e));
            }
        };
        core.trace_frame("recv", &conn.label, &msg);
        switchboard::dispatch(core.clone(), msg, conn.clone()).await;
    }

    Err(Error::Closed)
}
