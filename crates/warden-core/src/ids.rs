//! Branded ID newtypes.
//!
//! Channels, subscriptions, and pending requests each get their own ID type,
//! a newtype over `String`. Freshly generated IDs are UUID v7 (time-ordered);
//! IDs supplied by a UI surface are accepted verbatim via `From<&str>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// One open connection between a UI surface and the broker.
    ChannelId
}

branded_id! {
    /// A live subscription, unique across all channels of one broker.
    SubscriptionId
}

branded_id! {
    /// An outstanding approval-gated request in the pending queue.
    RequestId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_uuid_v7() {
        let id = ChannelId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
        assert_ne!(RequestId::default(), RequestId::default());
    }

    #[test]
    fn from_str_keeps_value() {
        let id = RequestId::from("req-1");
        assert_eq!(id.as_str(), "req-1");
        assert_eq!(&*id, "req-1");
        assert_eq!(format!("{id}"), "req-1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = SubscriptionId::from("sub-9");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sub-9\"");
        let back: SubscriptionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn into_string() {
        let s: String = ChannelId::from("chan").into();
        assert_eq!(s, "chan");
        assert_eq!(RequestId::from("x").into_inner(), "x");
    }
}
