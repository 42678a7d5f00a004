//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! MessageId where a ChannelId is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A channel identifier on the messaging platform.
///
/// Used for both source and destination channels. Platform channel ids may be
/// negative, hence the signed representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChannelId {
    fn from(n: i64) -> Self {
        ChannelId(n)
    }
}

/// A message identifier within a channel.
///
/// Message ids are assigned monotonically by the platform, so comparing two
/// ids from the same channel orders the messages in time. `MessageId(0)` is
/// the "nothing seen yet" sentinel used for freshly added channels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// The sentinel offset for a channel with no observed messages.
    pub const ZERO: MessageId = MessageId(0);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        MessageId(n)
    }
}

/// A media-group identifier.
///
/// The platform tags every item of a multi-item post with the same group id;
/// there is no explicit "end of group" marker. Group ids are only meaningful
/// within a single channel, so lookups key on `(ChannelId, GroupId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl From<u64> for GroupId {
    fn from(n: u64) -> Self {
        GroupId(n)
    }
}

/// The provenance of a media item: which channel and message it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub channel: ChannelId,
    pub message: MessageId,
}

impl Origin {
    pub fn new(channel: ChannelId, message: MessageId) -> Self {
        Origin { channel, message }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn channel_id_serde_roundtrip(n: i64) {
            let id = ChannelId(n);
            let json = serde_json::to_string(&id).unwrap();
            let parsed: ChannelId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(id, parsed);
        }

        #[test]
        fn message_id_ordering_matches_underlying(a: u64, b: u64) {
            let id_a = MessageId(a);
            let id_b = MessageId(b);
            prop_assert_eq!(id_a < id_b, a < b);
            prop_assert_eq!(id_a == id_b, a == b);
        }

        #[test]
        fn message_id_serde_roundtrip(n: u64) {
            let id = MessageId(n);
            let json = serde_json::to_string(&id).unwrap();
            let parsed: MessageId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(id, parsed);
        }

        #[test]
        fn origin_display_format(c: i64, m: u64) {
            let origin = Origin::new(ChannelId(c), MessageId(m));
            prop_assert_eq!(format!("{}", origin), format!("{}/#{}", c, m));
        }
    }

    #[test]
    fn zero_is_default() {
        assert_eq!(MessageId::default(), MessageId::ZERO);
    }
}
