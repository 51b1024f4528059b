// Copyright 2021 Joyent, Inc.

//! This module provides [`Node`], one endpoint of the Patch fabric. A node
//! both places calls and serves calls for names registered on it; the first
//! node to bind a socket path becomes the broker for everyone who dials it
//! afterwards.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

use crate::conn::{run_reader, send_frame, Connection};
use crate::error::{Error, BAD_TAG_MSG, CLOSED_MSG, FAIL_MSG};
use crate::pending::RequestTable;
use crate::protocol::PatchMessage;
use crate::register::{decode_payload, encode_payload, Handler};
use crate::routes::RouteTable;
use crate::switchboard;

/// How long a caller waits on a reply before probing the producer, and the
/// window within which a dead peer is reported.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(300);

/// Retry budget for tag collisions. The odds of hitting this are
/// astronomical with a 31-bit tag space; running into the cap means a peer
/// is misbehaving.
const MAX_TAG_RETRIES: usize = 8;

/// Default size of the accept semaphore.
const DEFAULT_CONNECTION_LIMIT: usize = 256;

/// Node-wide shared state: every connection and every in-flight call hangs
/// off one of these.
pub(crate) struct Core {
    /// This node's process-unique address, used as `src` on outgoing calls
    /// and matched against `dst` on incoming replies.
    pub(crate) addr: String,
    pub(crate) routes: RouteTable,
    pub(crate) pending: RequestTable,
    /// Local handler index; the same handlers also sit behind loopback
    /// connections in the route table.
    locals: RwLock<HashMap<String, Handler>>,
    /// Tags currently being serviced by local handler tasks.
    busy: StdMutex<HashSet<i32>>,
    uplink: RwLock<Option<Arc<Connection>>>,
    /// Flips to true the first time a route is added or an uplink comes up;
    /// callers gate on it so dial-then-call does not race the reader.
    ready: watch::Sender<bool>,
    limiter: StdMutex<Arc<Semaphore>>,
    log: RwLock<Logger>,
    debug: AtomicBool,
}

impl Core {
    pub(crate) fn new(addr: String) -> Arc<Core> {
        let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
        Arc::new(Core {
            addr,
            routes: RouteTable::default(),
            pending: RequestTable::default(),
            locals: RwLock::new(HashMap::new()),
            busy: StdMutex::new(HashSet::new()),
            uplink: RwLock::new(None),
            ready: watch::channel(false).0,
            limiter: StdMutex::new(Arc::new(Semaphore::new(
                DEFAULT_CONNECTION_LIMIT,
            ))),
            log: RwLock::new(log),
            debug: AtomicBool::new(false),
        })
    }

    pub(crate) fn log(&self) -> Logger {
        self.log.read().unwrap().clone()
    }

    pub(crate) fn set_log(&self, log: Logger) {
        *self.log.write().unwrap() = log;
    }

    pub(crate) fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    /// Logs one frame when debug tracing is on.
    pub(crate) fn trace_frame(
        &self,
        dir: &str,
        conn: &str,
        msg: &PatchMessage,
    ) {
        if !self.debug.load(Ordering::Relaxed) {
            return;
        }
        let log = self.log();
        if msg.tag == 0 {
            debug!(log, "route announcement";
                   "dir" => dir, "conn" => conn, "name" => %msg.src);
        } else {
            debug!(log, "frame";
                   "dir" => dir, "conn" => conn, "dst" => %msg.dst,
                   "src" => %msg.src, "tag" => msg.tag, "err" => %msg.err);
        }
    }

    pub(crate) fn add_route(&self, name: &str, conn: &Arc<Connection>) {
        self.routes.add(name, conn);
        self.ready.send_replace(true);
    }

    pub(crate) fn install_local(&self, name: &str, handler: Handler) {
        self.locals
            .write()
            .unwrap()
            .insert(String::from(name), handler);
    }

    pub(crate) fn uplink(&self) -> Option<Arc<Connection>> {
        self.uplink.read().unwrap().clone()
    }

    pub(crate) fn set_uplink(&self, conn: &Arc<Connection>) {
        *self.uplink.write().unwrap() = Some(conn.clone());
        self.ready.send_replace(true);
    }

    pub(crate) fn is_uplink(&self, conn: &Arc<Connection>) -> bool {
        match self.uplink.read().unwrap().as_ref() {
            Some(up) => Arc::ptr_eq(up, conn),
            None => false,
        }
    }

    fn uplink_alive(&self) -> Option<Arc<Connection>> {
        self.uplink().filter(|up| !up.is_closed())
    }

    pub(crate) fn busy_insert(&self, tag: i32) -> bool {
        self.busy.lock().unwrap().insert(tag)
    }

    pub(crate) fn busy_remove(&self, tag: i32) {
        self.busy.lock().unwrap().remove(&tag);
    }

    pub(crate) fn busy_holds(&self, tag: i32) -> bool {
        self.busy.lock().unwrap().contains(&tag)
    }

    fn limiter(&self) -> Arc<Semaphore> {
        self.limiter.lock().unwrap().clone()
    }

    async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as this Core, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// One endpoint of the Patch fabric.
///
/// A `Node` is cheap to clone; clones share the same routes, registrations,
/// and in-flight calls.
#[derive(Clone)]
pub struct Node {
    pub(crate) core: Arc<Core>,
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

impl Node {
    /// Creates an unbound node with a fresh process-unique address.
    pub fn new() -> Node {
        Node {
            core: Core::new(gen_addr()),
        }
    }

    /// This node's address on the fabric.
    pub fn addr(&self) -> &str {
        &self.core.addr
    }

    /// Resizes the accept semaphore. Affects connections accepted after the
    /// call; existing connections keep their tokens.
    pub fn set_connection_limit(&self, limit: usize) {
        *self.core.limiter.lock().unwrap() =
            Arc::new(Semaphore::new(limit));
    }

    /// Enables per-frame tracing at debug level.
    pub fn set_debug(&self, enabled: bool) {
        self.core.set_debug(enabled);
    }

    /// Redirects this node's log to `sink`. The default drain forwards to
    /// the standard `log` facade.
    pub fn set_log_sink<W>(&self, sink: W)
    where
        W: io::Write + Send + 'static,
    {
        let decorator = slog_term::PlainSyncDecorator::new(sink);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        self.core.set_log(Logger::root(drain, o!()));
    }

    /// Connects to the broker at `path` and returns once the uplink reader
    /// is running in the background.
    pub async fn dial<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        self.attach(stream, true).await
    }

    /// Binds `path` and serves as the broker, or falls through to dialing a
    /// broker that beat us to it. Blocks either way; when the dialed broker
    /// goes away this returns [`Error::Closed`].
    pub async fn listen<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();

        match UnixStream::connect(path).await {
            Ok(stream) => return self.attach(stream, false).await,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::NotFound
                ) => {}
            Err(e) => return Err(Error::Io(e)),
        }

        remove_stale_sockets(path)?;
        let listener = UnixListener::bind(path)?;
        info!(self.core.log(), "listening";
              "path" => %path.display(), "addr" => %self.core.addr);

        loop {
            let permit = self
                .core
                .limiter()
                .acquire_owned()
                .await
                .map_err(|_| Error::Closed)?;
            let (stream, _) = listener.accept().await?;
            let (read_half, write_half) = stream.into_split();
            let conn = Connection::socket("downlink", write_half);
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    run_reader(core.clone(), conn, read_half).await
                {
                    if !matches!(e, Error::Closed) {
                        warn!(core.log(), "connection reader failed";
                              "err" => %e);
                    }
                }
                drop(permit);
            });
        }
    }

    /// Installs `stream` as the uplink. In background mode the reader is
    /// spawned and this returns immediately; otherwise it blocks serving the
    /// connection until it dies.
    async fn attach(
        &self,
        stream: UnixStream,
        background: bool,
    ) -> Result<(), Error> {
        let (read_half, write_half) = stream.into_split();
        let conn = Connection::socket("uplink", write_half);
        self.core.set_uplink(&conn);

        if !background {
            return run_reader(self.core.clone(), conn, read_half).await;
        }

        let core = self.core.clone();
        tokio::spawn(async move {
            if let Err(e) = run_reader(core.clone(), conn, read_half).await {
                if !matches!(e, Error::Closed) {
                    warn!(core.log(), "uplink reader failed"; "err" => %e);
                }
            }
        });
        Ok(())
    }

    /// Invokes `name` with opaque payload strings and returns the reply
    /// payload. Blocks until the node is ready (at least one route or a live
    /// uplink), then probes the producer every 300 ms until a reply or a
    /// routing error arrives.
    pub async fn call_bytes(
        &self,
        name: &str,
        arg: &str,
        reply_seed: &str,
    ) -> Result<String, Error> {
        let core = &self.core;
        core.wait_ready().await;

        let mut attempts = 0;
        'request: loop {
            let (tag, mut rx) = core.pending.create();
            let req =
                PatchMessage::request(name, &core.addr, tag, arg, reply_seed);
            if let Err(e) = self.send_call(req).await {
                core.pending.cancel(tag);
                return Err(e);
            }

            loop {
                match timeout(LIVENESS_INTERVAL, &mut rx).await {
                    Ok(Ok(reply)) => {
                        if reply.err.is_empty() {
                            return Ok(reply.va2);
                        }
                        if reply.err == BAD_TAG_MSG {
                            attempts += 1;
                            if attempts >= MAX_TAG_RETRIES {
                                return Err(Error::DuplicateTag);
                            }
                            debug!(core.log(), "tag collision, retrying";
                                   "name" => name, "tag" => tag);
                            continue 'request;
                        }
                        if reply.err == FAIL_MSG {
                            return Err(Error::Unavailable);
                        }
                        if reply.err == CLOSED_MSG {
                            return Err(Error::Closed);
                        }
                        return Err(Error::Remote(reply.err));
                    }
                    // The table dropped our waiter out from under us.
                    Ok(Err(_)) => return Err(Error::Closed),
                    Err(_elapsed) => {
                        if core.uplink_alive().is_none()
                            && core.routes.find(name).is_none()
                        {
                            core.pending.cancel(tag);
                            return Err(Error::Closed);
                        }
                        let probe =
                            PatchMessage::probe(name, &core.addr, tag);
                        if let Err(e) = self.send_call(probe).await {
                            core.pending.cancel(tag);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Typed wrapper over [`call_bytes`](Node::call_bytes): the argument and
    /// the reply seed travel as Base64-wrapped JSON, and a non-empty reply
    /// payload is decoded into `reply`.
    pub async fn call<A, R>(
        &self,
        name: &str,
        arg: &A,
        reply: &mut R,
    ) -> Result<(), Error>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
    {
        let va1 = encode_payload(arg).map_err(Error::Payload)?;
        let seed = encode_payload(reply).map_err(Error::Payload)?;
        let out = self.call_bytes(name, &va1, &seed).await?;
        if !out.is_empty() {
            *reply = decode_payload(&out).map_err(Error::Payload)?;
        }
        Ok(())
    }

    /// Outbound path for requests and probes: a route for the name wins,
    /// then a live uplink; with neither the call cannot leave this node.
    async fn send_call(&self, msg: PatchMessage) -> Result<(), Error> {
        let core = &self.core;
        let dest = match core.routes.find(&msg.dst) {
            Some(conn) => conn,
            None => match core.uplink_alive() {
                Some(up) => up,
                None => return Err(Error::Closed),
            },
        };

        if dest.is_loopback() {
            // Calls to names registered on this very node go through the
            // switchboard like everything else.
            tokio::spawn(switchboard::dispatch(core.clone(), msg, dest));
            return Ok(());
        }

        send_frame(core, &dest, &msg)
            .await
            .map_err(|_| Error::Closed)
    }
}

/// A process-unique fabric address: `<random-31-bit>.<program-name>`.
fn gen_addr() -> String {
    let n: i32 = rand::thread_rng().gen_range(0..=i32::MAX);
    let prog = std::env::current_exe()
        .ok()
        .and_then(|p| {
            p.file_name().map(|f| f.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| String::from("patch"));
    format!("{}.{}", n, prog)
}

/// Clears out socket files left behind by crashed peers: anything in the
/// target directory whose name contains the socket's basename goes away.
fn remove_stale_sockets(path: &Path) -> Result<(), Error> {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => String::from(n),
        None => {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "incomplete path to socket file",
            )))
        }
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(&name) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addresses_are_unique_and_well_formed() {
        let a = gen_addr();
        let b = gen_addr();
        assert_ne!(a, b);
        let (tag, prog) = a.split_once('.').unwrap();
        assert!(tag.parse::<i32>().unwrap() >= 0);
        assert!(!prog.is_empty());
    }

    #[test]
    fn stale_socket_cleanup_matches_basename() {
        let dir = std::env::temp_dir().join(format!(
            "patch-stale-{}-{}",
            std::process::id(),
            rand::thread_rng().gen::<u32>()
        ));
        std::fs::create_dir(&dir).unwrap();

        let sock = dir.join("fabric.sock");
        std::fs::write(&sock, b"").unwrap();
        std::fs::write(dir.join("fabric.sock.123"), b"").unwrap();
        std::fs::write(dir.join("unrelated"), b"").unwrap();

        remove_stale_sockets(&sock).unwrap();

        assert!(!sock.exists());
        assert!(!dir.join("fabric.sock.123").exists());
        assert!(dir.join("unrelated").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
