//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the chat
//! server.

use chrono::{DateTime, FixedOffset, Utc};
use couple_chat_core::{ChatMessage, Identity, MessageId, QuestionId};
use serde::{Deserialize, Serialize};

/// Writer id carried by synthetic question entries.
pub const QUESTION_WRITER: &str = "question";

/// Wire format for server-generated timestamps.
const WIRE_TIME_FORMAT: &str = "%Y/%m/%d %I:%M";

//=========================================================================================
// Chat Entries (both directions)
//=========================================================================================
// A chat frame is a JSON array of entries, conventionally holding one entry.
// Flags are 0/1 integers on the wire.
//=========================================================================================

/// One chat entry as exchanged with the browser.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ChatEntry {
    pub text_body: String,
    pub writer_id: String,
    pub write_time: String,
    #[serde(with = "flag")]
    pub is_answer: bool,
    #[serde(with = "flag")]
    pub is_deleted: bool,
    #[serde(with = "flag")]
    pub is_file: bool,
    #[serde(with = "flag")]
    pub is_image: bool,
    pub chat_id: i32,
    pub question_id: i32,
}

impl ChatEntry {
    pub fn chat_id(&self) -> MessageId {
        MessageId(self.chat_id)
    }

    pub fn question_id(&self) -> QuestionId {
        QuestionId(self.question_id)
    }

    /// Builds the synthetic entry that presents a catalog question to both parties.
    pub fn question(question_id: QuestionId, prompt: &str, write_time: String) -> Self {
        Self {
            text_body: prompt.to_string(),
            writer_id: QUESTION_WRITER.to_string(),
            write_time,
            is_answer: true,
            question_id: question_id.0,
            ..Default::default()
        }
    }
}

impl From<ChatMessage> for ChatEntry {
    fn from(message: ChatMessage) -> Self {
        Self {
            text_body: message.text_body,
            writer_id: message.sender.to_string(),
            write_time: message.write_time,
            is_answer: false,
            is_deleted: message.is_deleted,
            is_file: message.is_file,
            is_image: message.is_image,
            chat_id: message.id.0,
            question_id: 0,
        }
    }
}

/// Formats "now" the way clients stamp their own messages.
pub fn wire_timestamp(now: DateTime<Utc>, offset: FixedOffset) -> String {
    now.with_timezone(&offset).format(WIRE_TIME_FORMAT).to_string()
}

mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(i64::deserialize(deserializer)? != 0)
    }
}

//=========================================================================================
// Frames Sent FROM the Server TO the Client
//=========================================================================================

/// The first frame of every session: tells the client which identity it is.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IdentityFrame {
    pub uuid: String,
}

/// Everything the writer worker of a session may put on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Identity(IdentityFrame),
    Chat(Vec<ChatEntry>),
    Ping,
}

impl Outbound {
    pub fn identity(identity: Identity) -> Self {
        Outbound::Identity(IdentityFrame {
            uuid: identity.to_string(),
        })
    }

    pub fn single(entry: ChatEntry) -> Self {
        Outbound::Chat(vec![entry])
    }

    /// The JSON text for data frames; `None` for control frames.
    pub fn to_json(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            Outbound::Identity(frame) => serde_json::to_string(frame).map(Some),
            Outbound::Chat(entries) => serde_json::to_string(entries).map(Some),
            Outbound::Ping => Ok(None),
        }
    }
}
