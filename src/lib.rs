// Copyright 2021 Joyent, Inc.

//! Patch: a peer-to-peer RPC switchboard over UNIX-domain sockets
//!
//! Patch lets a group of local processes call procedures registered by one
//! another without knowing which process owns what. Every participant is a
//! [`Node`]. The first node to bind a socket path becomes the *broker*;
//! every node that dials the path afterwards becomes its client, and may
//! itself register procedures that the broker will route calls to. The
//! resulting graph is a star, and the broker is transparent: callers address
//! procedures by name only.
//!
//! Protocol overview
//!
//! Communication is a stream of discrete _messages_. A message has six
//! fields, separated on the wire by the unit-separator byte `0x1f` and
//! terminated by the end-of-transmission byte `0x04`:
//!
//! | Field | Content |
//! | ----- | ------- |
//! | `DST` | Destination: a procedure name, or a node address for replies |
//! | `SRC` | The sender's node address (the announced name for `TAG` = 0) |
//! | `ERR` | Error string; empty means success |
//! | `TAG` | Signed 32-bit decimal correlation tag |
//! | `VA1` | Serialized call argument (opaque printable text) |
//! | `VA2` | Serialized reply value (opaque printable text) |
//!
//! ### Tags
//!
//! Each call is correlated by a tag drawn from a circular 31-bit space:
//!
//! | Tag value | Meaning |
//! | --------- | ------- |
//! | `0`       | Route announcement: `SRC` is reachable via this connection |
//! | positive  | An RPC request, or the reply completing it |
//! | negative  | Liveness probe for the request with tag `-TAG` |
//!
//! ### Messaging scenarios
//!
//! **A node announces a route.** On every new connection a node announces
//! its own address and every name it can already reach, one `TAG` = 0
//! message each, so reachability spreads transitively. Registering a
//! procedure announces its name to the uplink the same way.
//!
//! **A caller places a request.** The caller allocates a tag, sends a
//! request with `DST` set to the procedure name and `SRC` set to its own
//! address, and waits. Nodes along the way forward the message toward the
//! name's producer and remember the return path. Concurrent requests over
//! one connection are fine as long as the tags differ.
//!
//! **A producer replies.** The owning node runs the registered handler and
//! sends back a message with the same tag, `DST` and `SRC` swapped, and the
//! updated reply in `VA2` — or the handler's error string in `ERR`. The
//! reply retraces the request's path; the caller's pending call completes
//! when its address and tag match.
//!
//! **A caller probes a slow producer.** Every 300 ms without a reply, the
//! caller sends the negative form of the tag. A producer still working on
//! that tag swallows the probe; anywhere the probe cannot be routed, a
//! distinguished failure reply bounces back and ends the call.
//!
//! Routing failures travel as ordinary replies whose `ERR` carries one of
//! the distinguished strings in [`error`]; peers compare them byte-for-byte,
//! so they must never change.

pub mod error;
pub mod node;
pub mod protocol;
pub mod register;

mod conn;
mod pending;
mod routes;
mod switchboard;

pub use error::Error;
pub use node::Node;
pub use register::{json_handler, Handler, MethodSet};
