//! crates/couple_chat_core/src/domain.rs
//!
//! Defines the pure, core data structures for the chat service.
//! These structs are independent of any database or wire format.

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

//=========================================================================================
// Identifiers
//=========================================================================================

/// Stable opaque token identifying one user for the lifetime of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Uuid);

impl Identity {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses the textual form used by cookies and wire frames.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub i32);

        impl $name {
            /// Zero is the wire value for "not applicable".
            pub fn is_unset(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

numeric_id!(
    /// Numeric id of a connection (a pairing of two identities).
    ConnectionId
);
numeric_id!(
    /// Numeric id of a persisted chat message.
    MessageId
);
numeric_id!(
    /// Numeric id of a catalog question.
    QuestionId
);

//=========================================================================================
// Connections
//=========================================================================================

/// Which side of a connection an identity sits on. Decides the answer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairOrder {
    First,
    Second,
}

impl PairOrder {
    pub fn other(self) -> Self {
        match self {
            PairOrder::First => PairOrder::Second,
            PairOrder::Second => PairOrder::First,
        }
    }
}

/// A durable pairing of exactly two identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub connection_id: ConnectionId,
    pub first: Identity,
    pub second: Identity,
}

impl Pairing {
    /// Both parties, first then second.
    pub fn members(&self) -> [Identity; 2] {
        [self.first, self.second]
    }

    pub fn order_of(&self, identity: Identity) -> Option<PairOrder> {
        if identity == self.first {
            Some(PairOrder::First)
        } else if identity == self.second {
            Some(PairOrder::Second)
        } else {
            None
        }
    }
}

//=========================================================================================
// Messages, Questions and Answers
//=========================================================================================

/// A persisted chat message belonging to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: Identity,
    pub text_body: String,
    pub write_time: String,
    pub is_file: bool,
    pub is_image: bool,
    pub is_deleted: bool,
}

/// The fields needed to insert a new chat row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub text_body: String,
    pub sender: Identity,
    pub write_time: String,
    pub is_file: bool,
    pub is_image: bool,
}

/// A catalog entry: the trigger word and the prompt it causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: QuestionId,
    pub trigger_word: String,
    pub prompt: String,
}

impl Question {
    pub fn is_triggered_by(&self, text: &str) -> bool {
        !self.trigger_word.is_empty() && text.contains(self.trigger_word.as_str())
    }
}

/// Per-party answers to a question asked within one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRecord {
    pub connection_id: ConnectionId,
    pub question_id: QuestionId,
    pub prompt: String,
    pub first_answer: String,
    pub second_answer: String,
    pub asked_at: DateTime<Utc>,
}

impl AnswerRecord {
    pub fn answer_of(&self, order: PairOrder) -> &str {
        match order {
            PairOrder::First => &self.first_answer,
            PairOrder::Second => &self.second_answer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairing() -> Pairing {
        Pairing {
            connection_id: ConnectionId(7),
            first: Identity::new(Uuid::new_v4()),
            second: Identity::new(Uuid::new_v4()),
        }
    }

    #[test]
    fn pairing_resolves_order() {
        let p = pairing();
        assert_eq!(p.order_of(p.first), Some(PairOrder::First));
        assert_eq!(p.order_of(p.second), Some(PairOrder::Second));
        assert_eq!(p.order_of(Identity::new(Uuid::new_v4())), None);
    }

    #[test]
    fn empty_trigger_word_never_matches() {
        let q = Question {
            id: QuestionId(1),
            trigger_word: String::new(),
            prompt: "?".into(),
        };
        assert!(!q.is_triggered_by("anything"));
    }

    #[test]
    fn trigger_matches_substring() {
        let q = Question {
            id: QuestionId(3),
            trigger_word: "marry".into(),
            prompt: "Where should the wedding be?".into(),
        };
        assert!(q.is_triggered_by("will you marry me"));
        assert!(!q.is_triggered_by("hello"));
    }

    #[test]
    fn identity_parse_round_trips_display() {
        let id = Identity::new(Uuid::new_v4());
        assert_eq!(Identity::parse(&id.to_string()), Some(id));
        assert_eq!(Identity::parse("not-a-uuid"), None);
    }
}
