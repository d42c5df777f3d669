//! Opaque identifiers and pass-through values.
//!
//! None of these are interpreted by the engine beyond equality (and, for
//! message ids, an externally supplied ordering; see [`crate::cursor::IdOrdering`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::Serialize;

use crate::display::trim_for_display;

const ID_DISPLAY_MAX: usize = 128;

macro_rules! opaque_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Bytes);

        impl $name {
            pub fn new(bytes: impl Into<Bytes>) -> Self {
                Self(bytes.into())
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_bytes(self) -> Bytes {
                self.0
            }
        }

        impl From<&'static str> for $name {
            fn from(value: &'static str) -> Self {
                Self(Bytes::from_static(value.as_bytes()))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Bytes::from(value))
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(value: Vec<u8>) -> Self {
                Self(Bytes::from(value))
            }
        }

        impl From<Bytes> for $name {
            fn from(value: Bytes) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = String::from_utf8_lossy(&self.0);
                f.write_str(&trim_for_display(&text, ID_DISPLAY_MAX))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), String::from_utf8_lossy(&self.0))
            }
        }
    };
}

opaque_bytes!(
    /// Name of a publish topic. Case-sensitive, never parsed.
    ChannelName
);
opaque_bytes!(
    /// Identifier of a published message, unique within its channel.
    MessageId
);
opaque_bytes!(
    /// Logical client session spanning reconnects. Empty means no affinity.
    SessionId
);
opaque_bytes!(
    /// Requests with equal non-empty keys may share one backend fetch.
    SharingKey
);

/// Message body handed to the transport untouched.
pub type Payload = Bytes;

/// Inspector-supplied data forwarded to the backend untouched.
pub type UserData = Bytes;

/// Handle to a held client connection.
///
/// Handles are allocated from a process-wide counter, so comparing two
/// handles compares their registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HoldHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl HoldHandle {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HoldHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hold-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_increase_in_allocation_order() {
        let first = HoldHandle::next();
        let second = HoldHandle::next();
        assert!(first < second);
    }

    #[test]
    fn channel_names_are_case_sensitive() {
        assert_ne!(ChannelName::from("News"), ChannelName::from("news"));
        assert_eq!(ChannelName::from("news"), ChannelName::new(b"news".to_vec()));
    }

    #[test]
    fn display_is_lossy_and_bounded() {
        let long = MessageId::from("x".repeat(500));
        assert!(long.to_string().len() < 200);
        let raw = MessageId::from(vec![0xff, b'a']);
        assert_eq!(raw.to_string(), "\u{fffd}a");
    }
}
