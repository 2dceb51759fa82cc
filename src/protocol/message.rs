//! Protocol message definitions
//!
//! A [`Message`] is a tag plus a schemaless body. The transport only looks at the
//! tag; bodies are whatever the application put there.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Integer discriminator identifying a message's meaning and its request/reply pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub i32);

impl Tag {
    /// First envelope each side sends on a new connection, carrying its name
    pub const INTRODUCE: Tag = Tag(-1);
    /// Answer to [`Tag::INTRODUCE`], carrying the answering side's name
    pub const INTRODUCE_REPLY: Tag = Tag(-2);

    /// Whether the transport owns this tag
    pub fn is_reserved(self) -> bool {
        self == Self::INTRODUCE || self == Self::INTRODUCE_REPLY
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::INTRODUCE => write!(f, "introduce"),
            Tag::INTRODUCE_REPLY => write!(f, "introduce-reply"),
            Tag(raw) => match MessageKind::from_tag(*self) {
                Some(kind) => write!(f, "{:?}({})", kind, raw),
                None => write!(f, "tag({})", raw),
            },
        }
    }
}

/// Application message kinds.
///
/// Requests and their replies sit next to each other; [`MessageKind::reply`] gives the
/// pairing. The pairing is a convention the callers follow, the transport never checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageKind {
    Chat = 1,
    ChatReply = 2,
    Ready = 3,
    ReadyReply = 4,
    Busy = 5,
    BusyReply = 6,
    /// Asks whether the peer has switched from the lobby into game mode
    ModeCheck = 7,
    ModeCheckReply = 8,
    Start = 9,
    StartReply = 10,
    Ended = 11,
    EndedReply = 12,
    MapRequest = 13,
    Map = 14,
    ScoreRequest = 15,
    Score = 16,
    QueueRequest = 17,
    Queue = 18,
    PositionRequest = 19,
    Position = 20,
    SnapshotRequest = 21,
    Snapshot = 22,
    Control = 23,
    ControlReply = 24,
}

impl MessageKind {
    const ALL: [MessageKind; 24] = [
        MessageKind::Chat,
        MessageKind::ChatReply,
        MessageKind::Ready,
        MessageKind::ReadyReply,
        MessageKind::Busy,
        MessageKind::BusyReply,
        MessageKind::ModeCheck,
        MessageKind::ModeCheckReply,
        MessageKind::Start,
        MessageKind::StartReply,
        MessageKind::Ended,
        MessageKind::EndedReply,
        MessageKind::MapRequest,
        MessageKind::Map,
        MessageKind::ScoreRequest,
        MessageKind::Score,
        MessageKind::QueueRequest,
        MessageKind::Queue,
        MessageKind::PositionRequest,
        MessageKind::Position,
        MessageKind::SnapshotRequest,
        MessageKind::Snapshot,
        MessageKind::Control,
        MessageKind::ControlReply,
    ];

    pub fn tag(self) -> Tag {
        Tag(self as i32)
    }

    pub fn from_tag(tag: Tag) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.tag() == tag)
    }

    /// Reply kind paired with a request kind; odd discriminants are requests
    pub fn reply(self) -> Option<Self> {
        let raw = self as i32;
        if raw % 2 == 1 {
            Self::from_tag(Tag(raw + 1))
        } else {
            None
        }
    }
}

impl From<MessageKind> for Tag {
    fn from(kind: MessageKind) -> Self {
        kind.tag()
    }
}

/// One `(tag, body)` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub tag: Tag,
    pub body: Value,
}

impl Message {
    pub fn new(tag: impl Into<Tag>, body: Value) -> Self {
        Self {
            tag: tag.into(),
            body,
        }
    }

    /// Message without a body
    pub fn empty(tag: impl Into<Tag>) -> Self {
        Self::new(tag, Value::Null)
    }

    /// Build a message from any serializable body
    pub fn with_body<T: Serialize>(tag: impl Into<Tag>, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(tag, serde_json::to_value(body)?))
    }

    /// Handshake opener carrying the sender's name
    pub fn introduce(name: &str) -> Self {
        Self::new(Tag::INTRODUCE, Value::String(name.to_string()))
    }

    /// Handshake answer carrying the answering side's name
    pub fn introduce_reply(name: &str) -> Self {
        Self::new(Tag::INTRODUCE_REPLY, Value::String(name.to_string()))
    }

    /// Decode the body into a concrete type
    pub fn body_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_tags() {
        assert!(Tag::INTRODUCE.is_reserved());
        assert!(Tag::INTRODUCE_REPLY.is_reserved());
        assert!(!MessageKind::Chat.tag().is_reserved());
        assert_eq!(Tag::INTRODUCE, Tag(-1));
        assert_eq!(Tag::INTRODUCE_REPLY, Tag(-2));
    }

    #[test]
    fn test_request_reply_pairing() {
        assert_eq!(MessageKind::Chat.reply(), Some(MessageKind::ChatReply));
        assert_eq!(MessageKind::SnapshotRequest.reply(), Some(MessageKind::Snapshot));
        assert_eq!(MessageKind::Control.reply(), Some(MessageKind::ControlReply));
        assert_eq!(MessageKind::ChatReply.reply(), None);
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(MessageKind::from_tag(Tag(999)), None);
    }

    #[test]
    fn test_typed_body() {
        let msg = Message::with_body(MessageKind::Position, &("alice", vec![(6, 3), (6, 4)])).unwrap();
        assert_eq!(msg.body, json!(["alice", [[6, 3], [6, 4]]]));

        let (name, cells): (String, Vec<(i32, i32)>) = msg.body_as().unwrap();
        assert_eq!(name, "alice");
        assert_eq!(cells, vec![(6, 3), (6, 4)]);
        assert!(msg.body_as::<u64>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Tag::INTRODUCE.to_string(), "introduce");
        assert_eq!(MessageKind::Chat.tag().to_string(), "Chat(1)");
        assert_eq!(Tag(77).to_string(), "tag(77)");
    }
}
