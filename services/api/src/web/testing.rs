//! In-memory implementation of every collaborator port, for unit tests.
//!
//! Records what the real-time core did to it and can be told to fail.

use crate::config::Config;
use crate::web::state::{AppState, Collaborators};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use couple_chat_core::{
    AnswerRecord, AnswerStore, BlobStore, ChatMessage, ConnectionId, Identity, IdentityResolver,
    MessageId, MessageStore, NewChatMessage, PairOrder, Pairing, PairingDirectory, PortError,
    PortResult, Question, QuestionCatalog, QuestionId, QuestionStream,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryState {
    pub pairings: Vec<Pairing>,
    pub messages: Vec<ChatMessage>,
    pub questions: Vec<Question>,
    pub answers: Vec<AnswerRecord>,
    pub blobs: Vec<String>,
    pub removed_blobs: Vec<String>,
    pub failing_blobs: HashSet<MessageId>,
    pub deleted_connections: Vec<ConnectionId>,
    pub fail_message_inserts: bool,
    pub fail_catalog: bool,
    pub fail_answer_inserts: bool,
    pub catalog_streams: usize,
    /// When set, `pairing_by_connection` waits for a notification first.
    pub pairing_gate: Option<Arc<Notify>>,
    /// When set, `AnswerStore::exists` for that connection waits for a notification first.
    pub answer_gate: Option<(ConnectionId, Arc<Notify>)>,
    next_message_id: i32,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Creates a connection between two fresh identities.
    pub fn pair(&self, connection_id: i32) -> Pairing {
        let pairing = Pairing {
            connection_id: ConnectionId(connection_id),
            first: Identity::new(Uuid::new_v4()),
            second: Identity::new(Uuid::new_v4()),
        };
        self.state().pairings.push(pairing.clone());
        pairing
    }

    pub fn add_question(&self, id: i32, trigger_word: &str, prompt: &str) {
        self.state().questions.push(Question {
            id: QuestionId(id),
            trigger_word: trigger_word.to_string(),
            prompt: prompt.to_string(),
        });
    }

    pub fn add_blob(&self, name: &str) {
        self.state().blobs.push(name.to_string());
    }

    /// Seeds a stored message and returns its id.
    pub fn add_message(&self, sender: Identity, text: &str, is_file: bool) -> MessageId {
        let mut state = self.state();
        state.next_message_id += 1;
        let id = MessageId(state.next_message_id);
        state.messages.push(ChatMessage {
            id,
            sender,
            text_body: text.to_string(),
            write_time: "2024/01/01 10:00".to_string(),
            is_file,
            is_image: false,
            is_deleted: false,
        });
        id
    }

    pub fn answer(&self, connection_id: ConnectionId, question_id: QuestionId) -> Option<AnswerRecord> {
        self.state()
            .answers
            .iter()
            .find(|a| a.connection_id == connection_id && a.question_id == question_id)
            .cloned()
    }

    pub fn message(&self, id: MessageId) -> Option<ChatMessage> {
        self.state().messages.iter().find(|m| m.id == id).cloned()
    }
}

/// Builds the full application state on top of one memory store, with default config.
pub fn app_state(store: Arc<MemoryStore>) -> Arc<AppState> {
    app_state_with(store, &[])
}

/// Like `app_state`, with some configuration variables overridden.
pub fn app_state_with(store: Arc<MemoryStore>, overrides: &[(&str, &str)]) -> Arc<AppState> {
    let config = Config::from_lookup(|key| {
        overrides
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.to_string())
            .or_else(|| (key == "DATABASE_URL").then(|| "postgres://localhost/couple_chat_test".to_string()))
    })
    .expect("test config");
    let ports = Collaborators {
        identities: store.clone(),
        directory: store.clone(),
        messages: store.clone(),
        catalog: store.clone(),
        answers: store.clone(),
        blobs: store,
    };
    Arc::new(AppState::new(Arc::new(config), ports))
}

#[async_trait]
impl IdentityResolver for MemoryStore {
    async fn resolve_identity(&self, token: &str) -> PortResult<Identity> {
        let identity = Identity::parse(token).ok_or(PortError::Unauthorized)?;
        let known = self
            .state()
            .pairings
            .iter()
            .any(|p| p.first == identity || p.second == identity);
        if known {
            Ok(identity)
        } else {
            Err(PortError::Unauthorized)
        }
    }
}

#[async_trait]
impl PairingDirectory for MemoryStore {
    async fn resolve_pairing(&self, identity: Identity) -> PortResult<Pairing> {
        self.state()
            .pairings
            .iter()
            .find(|p| p.order_of(identity).is_some())
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("No pairing for {}", identity)))
    }

    async fn order_of(&self, identity: Identity) -> PortResult<PairOrder> {
        self.resolve_pairing(identity)
            .await?
            .order_of(identity)
            .ok_or_else(|| PortError::NotFound(format!("No order for {}", identity)))
    }

    async fn pairing_by_connection(&self, connection_id: ConnectionId) -> PortResult<Pairing> {
        let gate = self.state().pairing_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state()
            .pairings
            .iter()
            .find(|p| p.connection_id == connection_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Connection {} not found", connection_id)))
    }

    async fn delete_connection(&self, pairing: &Pairing) -> PortResult<()> {
        let mut state = self.state();
        state.pairings.retain(|p| p.connection_id != pairing.connection_id);
        state
            .messages
            .retain(|m| m.sender != pairing.first && m.sender != pairing.second);
        state
            .answers
            .retain(|a| a.connection_id != pairing.connection_id);
        state.deleted_connections.push(pairing.connection_id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: NewChatMessage) -> PortResult<MessageId> {
        let mut state = self.state();
        if state.fail_message_inserts {
            return Err(PortError::Persistence("insert refused".to_string()));
        }
        state.next_message_id += 1;
        let id = MessageId(state.next_message_id);
        state.messages.push(ChatMessage {
            id,
            sender: message.sender,
            text_body: message.text_body,
            write_time: message.write_time,
            is_file: message.is_file,
            is_image: message.is_image,
            is_deleted: false,
        });
        Ok(id)
    }

    async fn find_message(&self, message_id: MessageId) -> PortResult<Option<ChatMessage>> {
        Ok(self.message(message_id))
    }

    async fn soft_delete(&self, message_id: MessageId) -> PortResult<()> {
        let mut state = self.state();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| PortError::NotFound(format!("Message {} not found", message_id)))?;
        message.is_deleted = true;
        Ok(())
    }

    async fn list_by_connection(
        &self,
        first: Identity,
        second: Identity,
    ) -> PortResult<Vec<ChatMessage>> {
        Ok(self
            .state()
            .messages
            .iter()
            .filter(|m| m.sender == first || m.sender == second)
            .cloned()
            .collect())
    }

    async fn pending_question_for_order(
        &self,
        order: PairOrder,
        connection_id: ConnectionId,
    ) -> PortResult<Option<QuestionId>> {
        Ok(self
            .state()
            .answers
            .iter()
            .filter(|a| a.connection_id == connection_id && a.answer_of(order).is_empty())
            .min_by_key(|a| a.asked_at)
            .map(|a| a.question_id))
    }

    async fn latest_file_message(&self, sender: Identity) -> PortResult<Option<ChatMessage>> {
        Ok(self
            .state()
            .messages
            .iter()
            .rev()
            .find(|m| m.sender == sender && m.is_file)
            .cloned())
    }
}

#[async_trait]
impl QuestionCatalog for MemoryStore {
    async fn stream_questions(&self) -> PortResult<QuestionStream> {
        let mut state = self.state();
        if state.fail_catalog {
            return Err(PortError::Persistence("catalog offline".to_string()));
        }
        state.catalog_streams += 1;
        let questions = state.questions.clone();
        Ok(Box::pin(futures::stream::iter(questions.into_iter().map(Ok))))
    }

    async fn find_question(&self, question_id: QuestionId) -> PortResult<Question> {
        self.state()
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Question {} not found", question_id)))
    }
}

#[async_trait]
impl AnswerStore for MemoryStore {
    async fn exists(&self, connection_id: ConnectionId, question_id: QuestionId) -> PortResult<bool> {
        let gate = self
            .state()
            .answer_gate
            .clone()
            .filter(|(gated, _)| *gated == connection_id);
        if let Some((_, gate)) = gate {
            gate.notified().await;
        }
        Ok(self.answer(connection_id, question_id).is_some())
    }

    async fn insert(
        &self,
        asked_at: DateTime<Utc>,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        let mut state = self.state();
        if state.fail_answer_inserts {
            return Err(PortError::Persistence("answer insert refused".to_string()));
        }
        let prompt = state
            .questions
            .iter()
            .find(|q| q.id == question_id)
            .map(|q| q.prompt.clone())
            .unwrap_or_default();
        state.answers.push(AnswerRecord {
            connection_id,
            question_id,
            prompt,
            first_answer: String::new(),
            second_answer: String::new(),
            asked_at,
        });
        Ok(())
    }

    async fn update_first(
        &self,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        let mut state = self.state();
        if let Some(a) = state
            .answers
            .iter_mut()
            .find(|a| a.connection_id == connection_id && a.question_id == question_id)
        {
            a.first_answer = text.to_string();
        }
        Ok(())
    }

    async fn update_second(
        &self,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        let mut state = self.state();
        if let Some(a) = state
            .answers
            .iter_mut()
            .find(|a| a.connection_id == connection_id && a.question_id == question_id)
        {
            a.second_answer = text.to_string();
        }
        Ok(())
    }

    async fn list_for_connection(&self, connection_id: ConnectionId) -> PortResult<Vec<AnswerRecord>> {
        Ok(self
            .state()
            .answers
            .iter()
            .filter(|a| a.connection_id == connection_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn remove_for_message(&self, message_id: MessageId) -> PortResult<usize> {
        let mut state = self.state();
        if state.failing_blobs.contains(&message_id) {
            return Err(PortError::Persistence(format!("cannot remove blob of {}", message_id)));
        }
        let prefix = format!("{}-", message_id);
        let (removed, kept): (Vec<String>, Vec<String>) =
            state.blobs.drain(..).partition(|name| name.starts_with(&prefix));
        state.blobs = kept;
        let count = removed.len();
        state.removed_blobs.extend(removed);
        Ok(count)
    }
}
