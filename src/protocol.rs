// Copyright 2021 Joyent, Inc.

//! This module contains the types and functions used to encode and decode
//! Patch messages. The contents of this module are not needed for normal
//! consumers of this crate, but they are exposed for the special case of
//! someone needing to speak the wire protocol directly.

use std::io::{Error, ErrorKind};
use std::{fmt, io, str};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Separates the six fields of a message on the wire.
pub const FIELD_SEP: u8 = 0x1f;

/// Terminates a message on the wire. The reader resynchronizes on this byte,
/// so field values must never contain it.
pub const FRAME_END: u8 = 0x04;

/// An error type representing a failure to parse a buffer as a Patch message.
#[derive(Debug)]
pub enum PatchParseError {
    /// The frame did not contain exactly six fields.
    FieldCount(usize),
    /// The tag field was not a decimal 32-bit integer.
    BadTag(String),
    /// The frame was not valid UTF-8.
    NotUtf8,
}

impl fmt::Display for PatchParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PatchParseError::FieldCount(n) => {
                write!(f, "incomplete or corrupted message: {} fields", n)
            }
            PatchParseError::BadTag(s) => {
                write!(f, "unparsable message tag: {:?}", s)
            }
            PatchParseError::NotUtf8 => f.write_str("message is not valid UTF-8"),
        }
    }
}

impl From<PatchParseError> for Error {
    fn from(pfr: PatchParseError) -> Self {
        Error::new(ErrorKind::InvalidData, pfr.to_string())
    }
}

/// One Patch protocol message.
///
/// `tag == 0` is a route announcement carrying the announced name in `src`; a
/// positive tag identifies a request or its reply; a negative tag is the
/// liveness probe for the corresponding positive tag. The payload fields
/// `va1`/`va2` are opaque printable strings to this layer; registration-level
/// encoders decide what goes in them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PatchMessage {
    /// Destination name: a procedure name or a node address.
    pub dst: String,
    /// Sender: the caller's node address, or the announced name when `tag`
    /// is zero.
    pub src: String,
    /// Error string; empty means success.
    pub err: String,
    /// Correlation tag.
    pub tag: i32,
    /// Serialized call argument.
    pub va1: String,
    /// Serialized reply value.
    pub va2: String,
}

impl PatchMessage {
    /// Returns an announcement advertising that `name` is reachable via the
    /// connection this message is sent on.
    pub fn announcement(name: String) -> PatchMessage {
        PatchMessage {
            src: name,
            ..PatchMessage::default()
        }
    }

    /// Returns a request for procedure `dst` from the node addressed `src`.
    pub fn request(
        dst: &str,
        src: &str,
        tag: i32,
        va1: &str,
        va2: &str,
    ) -> PatchMessage {
        PatchMessage {
            dst: String::from(dst),
            src: String::from(src),
            err: String::new(),
            tag,
            va1: String::from(va1),
            va2: String::from(va2),
        }
    }

    /// Returns the liveness probe for an outstanding request with tag `tag`.
    pub fn probe(dst: &str, src: &str, tag: i32) -> PatchMessage {
        PatchMessage {
            dst: String::from(dst),
            src: String::from(src),
            tag: -tag,
            ..PatchMessage::default()
        }
    }

    /// Consumes a message that cannot be delivered and produces the error
    /// reply for its sender: destination and source swap, payloads blank,
    /// and a probe tag flips back to its positive form.
    pub fn into_error_reply(mut self, err: &str) -> PatchMessage {
        std::mem::swap(&mut self.dst, &mut self.src);
        self.va1.clear();
        self.va2.clear();
        self.err = String::from(err);
        if self.tag < 0 {
            self.tag = self.tag.wrapping_neg();
        }
        self
    }

    /// Parse one frame (without its terminating [`FRAME_END`] byte) into a
    /// `PatchMessage`.
    pub fn parse(buf: &[u8]) -> Result<PatchMessage, PatchParseError> {
        let text = str::from_utf8(buf).map_err(|_| PatchParseError::NotUtf8)?;
        let parts: Vec<&str> = text.split(FIELD_SEP as char).collect();
        if parts.len() != 6 {
            return Err(PatchParseError::FieldCount(parts.len()));
        }

        let tag = parts[3]
            .parse::<i32>()
            .map_err(|_| PatchParseError::BadTag(String::from(parts[3])))?;

        Ok(PatchMessage {
            dst: String::from(parts[0]),
            src: String::from(parts[1]),
            err: String::from(parts[2]),
            tag,
            va1: String::from(parts[4]),
            va2: String::from(parts[5]),
        })
    }
}

/// Encode a `PatchMessage` into a byte buffer, including the frame
/// terminator.
pub fn encode_msg(msg: &PatchMessage, buf: &mut BytesMut) {
    let tag = msg.tag.to_string();
    let fields = [
        msg.dst.as_str(),
        msg.src.as_str(),
        msg.err.as_str(),
        tag.as_str(),
        msg.va1.as_str(),
        msg.va2.as_str(),
    ];

    let len: usize = fields.iter().map(|f| f.len() + 1).sum();
    buf.reserve(len);
    for (n, field) in fields.iter().enumerate() {
        if n > 0 {
            buf.extend_from_slice(&[FIELD_SEP]);
        }
        buf.extend_from_slice(field.as_bytes());
    }
    buf.extend_from_slice(&[FRAME_END]);
}

/// This type implements the functions necessary for Patch protocol framing.
pub struct PatchCodec;

impl Decoder for PatchCodec {
    type Item = PatchMessage;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Error> {
        let end = match buf.iter().position(|&b| b == FRAME_END) {
            Some(n) => n,
            // No terminator yet; let the Framed instance read more data
            // before calling this function again.
            None => return Ok(None),
        };

        let frame = buf.split_to(end + 1);
        let msg = PatchMessage::parse(&frame[..end])?;
        Ok(Some(msg))
    }
}

impl Encoder<PatchMessage> for PatchCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: PatchMessage,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        encode_msg(&item, buf);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    // Wire fields may be any printable text that avoids the two delimiter
    // bytes; registration-layer encoders guarantee this with Base64.
    fn wire_field(g: &mut Gen) -> String {
        const CHARS: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz\
              0123456789+/=._- ";
        let len = usize::arbitrary(g) % 32;
        (0..len)
            .map(|_| *g.choose(CHARS).unwrap() as char)
            .collect()
    }

    impl Arbitrary for PatchMessage {
        fn arbitrary(g: &mut Gen) -> PatchMessage {
            PatchMessage {
                dst: wire_field(g),
                src: wire_field(g),
                err: wire_field(g),
                tag: i32::arbitrary(g),
                va1: wire_field(g),
                va2: wire_field(g),
            }
        }
    }

    quickcheck! {
        fn prop_patch_message_roundtrip(msg: PatchMessage) -> bool {
            let mut buf = BytesMut::new();
            encode_msg(&msg, &mut buf);
            match PatchMessage::parse(&buf[..buf.len() - 1]) {
                Ok(decoded) => decoded == msg,
                Err(_) => false,
            }
        }
    }

    quickcheck! {
        fn prop_patch_codec_bundling(msgs: Vec<PatchMessage>) -> bool {
            let mut buf = BytesMut::new();
            for msg in &msgs {
                encode_msg(msg, &mut buf);
            }

            let mut codec = PatchCodec;
            let mut decoded = Vec::new();
            while let Ok(Some(msg)) = codec.decode(&mut buf) {
                decoded.push(msg);
            }

            buf.is_empty() && decoded == msgs
        }
    }

    #[test]
    fn golden_frame_layout() {
        let msg = PatchMessage {
            dst: String::from("Echo"),
            src: String::from("123.demo"),
            err: String::new(),
            tag: 42,
            va1: String::from("aGk="),
            va2: String::from("bnVsbA=="),
        };
        let mut buf = BytesMut::new();
        encode_msg(&msg, &mut buf);
        assert_eq!(
            &buf[..],
            b"Echo\x1f123.demo\x1f\x1f42\x1faGk=\x1fbnVsbA==\x04"
        );
    }

    #[test]
    fn negative_tag_roundtrip() {
        let probe = PatchMessage::probe("Echo", "9.demo", 42);
        assert_eq!(probe.tag, -42);

        let mut buf = BytesMut::new();
        encode_msg(&probe, &mut buf);
        let decoded = PatchMessage::parse(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(decoded, probe);
    }

    #[test]
    fn split_stream_reassembly() {
        let msgs: Vec<PatchMessage> = (1..=3)
            .map(|n| PatchMessage::request("a", "b", n, "x", "y"))
            .collect();

        let mut wire = BytesMut::new();
        for msg in &msgs {
            encode_msg(msg, &mut wire);
        }
        let frame_len = wire.len() / 3;

        // Two full frames followed by the first byte of the third.
        let mut buf = BytesMut::from(&wire[..2 * frame_len + 1]);

        let mut codec = PatchCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msgs[0].clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msgs[1].clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        // The rest of the third frame arrives.
        buf.extend_from_slice(&wire[2 * frame_len + 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msgs[2].clone()));
        assert!(buf.is_empty());
    }

    #[test]
    fn short_frame_fails_decode() {
        let mut buf = BytesMut::from(&b"a\x1fb\x1fc\x04"[..]);
        assert!(PatchCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn unparsable_tag_fails_decode() {
        let mut buf = BytesMut::from(&b"a\x1fb\x1f\x1fzz\x1f\x1f\x04"[..]);
        assert!(PatchCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn error_reply_swaps_and_flips() {
        let probe = PatchMessage::probe("Echo", "9.demo", 7);
        let reply = probe.into_error_reply("Connection closed.");
        assert_eq!(reply.dst, "9.demo");
        assert_eq!(reply.src, "Echo");
        assert_eq!(reply.tag, 7);
        assert_eq!(reply.err, "Connection closed.");
        assert!(reply.va1.is_empty() && reply.va2.is_empty());
    }
}
