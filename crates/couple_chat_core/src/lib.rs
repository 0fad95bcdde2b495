pub mod domain;
pub mod ports;

pub use domain::{
    AnswerRecord, ChatMessage, ConnectionId, Identity, MessageId, NewChatMessage, PairOrder,
    Pairing, Question, QuestionId,
};
pub use ports::{
    AnswerStore, BlobStore, IdentityResolver, MessageStore, PairingDirectory, PortError,
    PortResult, QuestionCatalog, QuestionStream,
};
