// Copyright 2021 Joyent, Inc.

//! The error type shared by every `patch-ipc` operation. The first three
//! variants correspond to the distinguished wire strings that peers compare
//! byte-for-byte, so their `Display` output must never change.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Wire string for a request that could not be routed to any producer.
pub const FAIL_MSG: &str = "Request failed, service unavailable.";

/// Wire string for a request or reply lost to a dead connection.
pub const CLOSED_MSG: &str = "Connection closed.";

/// Wire string for a request whose tag is already being serviced.
pub const BAD_TAG_MSG: &str = "Duplicate tag detected.";

/// An error returned by [`Node`](crate::Node) operations.
#[derive(Debug)]
pub enum Error {
    /// No producer anywhere in the fabric services the requested name.
    Unavailable,
    /// The connection carrying the request or reply went away.
    Closed,
    /// Tag collision retries were exhausted without a clean allocation.
    DuplicateTag,
    /// An error string produced by a remote handler, delivered verbatim.
    Remote(String),
    /// Argument or reply (de)serialization failed in a typed call.
    Payload(String),
    /// A socket-level failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Unavailable => f.write_str(FAIL_MSG),
            Error::Closed => f.write_str(CLOSED_MSG),
            Error::DuplicateTag => f.write_str(BAD_TAG_MSG),
            Error::Remote(msg) => f.write_str(msg),
            Error::Payload(msg) => write!(f, "payload encoding failed: {}", msg),
            Error::Io(e) => e.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinel_strings_are_stable() {
        assert_eq!(
            Error::Unavailable.to_string(),
            "Request failed, service unavailable."
        );
        assert_eq!(Error::Closed.to_string(), "Connection closed.");
        assert_eq!(Error::DuplicateTag.to_string(), "Duplicate tag detected.");
    }

    #[test]
    fn remote_errors_pass_through_verbatim() {
        let err = Error::Remote(String::from("Key not found."));
        assert_eq!(err.to_string(), "Key not found.");
    }
}
