// Copyright 2021 Joyent, Inc.

//! Handler registration. The switchboard core hands a handler two printable
//! strings — the serialized argument and the serialized reply seed — and
//! takes back either the updated reply payload or an error string; nothing
//! in the core interprets the payloads. This module installs such handlers
//! and provides the typed JSON/Base64 envelope most producers want instead
//! of raw strings.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::debug;

use crate::conn::{send_frame, Connection};
use crate::node::Node;
use crate::protocol::PatchMessage;

/// A registered procedure: `(serialized_arg, serialized_reply_seed)` in,
/// updated serialized reply or error string out.
pub type Handler =
    Arc<dyn Fn(&str, &str) -> Result<String, String> + Send + Sync>;

/// A set of named procedures carried by one object, registered together
/// under a common prefix with [`Node::register_object`]. Only methods whose
/// names begin with an uppercase letter are exported; the rest stay private
/// to the process.
pub trait MethodSet {
    /// The object's full method table, exported or not; registration does
    /// the filtering.
    fn methods(&self) -> Vec<(String, Handler)>;
}

impl Node {
    /// Registers `handler` under `name` and announces the name to the
    /// uplink, if one is up. Names registered before dialing are announced
    /// by the reader's startup burst instead.
    pub fn register_handler(&self, name: &str, handler: Handler) {
        let conn = Connection::loopback(name, handler.clone());
        self.core.install_local(name, handler);
        self.core.add_route(name, &conn);

        if let Some(uplink) = self.core.uplink() {
            if uplink.is_closed() {
                return;
            }
            let core = self.core.clone();
            let ann = PatchMessage::announcement(String::from(name));
            tokio::spawn(async move {
                if let Err(e) = send_frame(&core, &uplink, &ann).await {
                    debug!(core.log(), "registration announcement failed";
                           "name" => %ann.src, "err" => %e);
                }
            });
        }
    }

    /// Registers a raw closure under `name`. See [`Handler`] for the
    /// payload contract.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&str, &str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(handler));
    }

    /// Registers a typed function under `name`. The argument and reply
    /// travel as Base64-wrapped JSON; the function fills in the reply and
    /// returns an error string on failure, which the caller receives
    /// verbatim.
    pub fn register_fn<A, R, F>(&self, name: &str, f: F)
    where
        A: DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: Fn(A, &mut R) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register_handler(name, json_handler(f));
    }

    /// Registers every exported method of `object` as
    /// `<prefix>.<MethodName>`. A method is exported when its name starts
    /// with an uppercase letter.
    pub fn register_object(&self, prefix: &str, object: &dyn MethodSet) {
        for (method, handler) in object.methods() {
            let exported = method
                .chars()
                .next()
                .map(char::is_uppercase)
                .unwrap_or(false);
            if !exported {
                continue;
            }
            self.register_handler(
                &format!("{}.{}", prefix, method),
                handler,
            );
        }
    }
}

/// Wraps a typed function in the JSON/Base64 envelope, producing a raw
/// [`Handler`].
pub fn json_handler<A, R, F>(f: F) -> Handler
where
    A: DeserializeOwned,
    R: Serialize + DeserializeOwned,
    F: Fn(A, &mut R) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(move |va1: &str, va2: &str| {
        let arg: A = decode_payload(va1)?;
        let mut reply: R = decode_payload(va2)?;
        f(arg, &mut reply)?;
        encode_payload(&reply)
    })
}

pub(crate) fn encode_payload<T: Serialize>(
    value: &T,
) -> Result<String, String> {
    let raw = serde_json::to_vec(value).map_err(|e| e.to_string())?;
    Ok(base64::encode(raw))
}

pub(crate) fn decode_payload<T: DeserializeOwned>(
    field: &str,
) -> Result<T, String> {
    let raw = base64::decode(field).map_err(|e| e.to_string())?;
    serde_json::from_slice(&raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let encoded = encode_payload(&("hi".to_string(), 7u32)).unwrap();
        // Base64 keeps the wire free of delimiter bytes.
        assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric()
            || b == b'+'
            || b == b'/'
            || b == b'='));
        let (s, n): (String, u32) = decode_payload(&encoded).unwrap();
        assert_eq!((s.as_str(), n), ("hi", 7));
    }

    #[test]
    fn json_handler_fills_reply() {
        let h = json_handler(|arg: String, out: &mut String| {
            *out = arg;
            Ok(())
        });
        let va1 = encode_payload(&"hello".to_string()).unwrap();
        let va2 = encode_payload(&String::new()).unwrap();
        let out = h(&va1, &va2).unwrap();
        let reply: String = decode_payload(&out).unwrap();
        assert_eq!(reply, "hello");
    }

    #[test]
    fn json_handler_reports_garbage_payloads() {
        let h = json_handler(|_: u32, _: &mut u32| Ok(()));
        assert!(h("not base64!", "").is_err());
    }

    #[test]
    fn json_handler_propagates_handler_errors() {
        let h = json_handler(|_: u32, _: &mut u32| {
            Err(String::from("Key not found."))
        });
        let va1 = encode_payload(&1u32).unwrap();
        let va2 = encode_payload(&0u32).unwrap();
        assert_eq!(h(&va1, &va2).unwrap_err(), "Key not found.");
    }
}
