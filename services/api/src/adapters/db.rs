//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, the concrete implementation of
//! every store port from the `core` crate. It handles all interactions with
//! the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use couple_chat_core::domain::{
    AnswerRecord, ChatMessage, ConnectionId, Identity, MessageId, NewChatMessage, PairOrder,
    Pairing, Question, QuestionId,
};
use couple_chat_core::ports::{
    AnswerStore, IdentityResolver, MessageStore, PairingDirectory, PortError, PortResult,
    QuestionCatalog, QuestionStream,
};
use futures::StreamExt;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the store ports.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn persistence(e: sqlx::Error) -> PortError {
    PortError::Persistence(e.to_string())
}

fn order_column(order: PairOrder) -> &'static str {
    match order {
        PairOrder::First => "first_answer",
        PairOrder::Second => "second_answer",
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct PairingRecord {
    connection_id: i32,
    first_id: Uuid,
    second_id: Uuid,
}
impl PairingRecord {
    fn to_domain(self) -> Pairing {
        Pairing {
            connection_id: ConnectionId(self.connection_id),
            first: Identity::new(self.first_id),
            second: Identity::new(self.second_id),
        }
    }
}

#[derive(FromRow)]
struct ChatRecord {
    chat_id: i32,
    writer_id: Uuid,
    text_body: String,
    write_time: String,
    is_file: bool,
    is_image: bool,
    is_deleted: bool,
}
impl ChatRecord {
    fn to_domain(self) -> ChatMessage {
        ChatMessage {
            id: MessageId(self.chat_id),
            sender: Identity::new(self.writer_id),
            text_body: self.text_body,
            write_time: self.write_time,
            is_file: self.is_file,
            is_image: self.is_image,
            is_deleted: self.is_deleted,
        }
    }
}

#[derive(FromRow)]
struct QuestionRecord {
    question_id: i32,
    trigger_word: String,
    prompt: String,
}
impl QuestionRecord {
    fn to_domain(self) -> Question {
        Question {
            id: QuestionId(self.question_id),
            trigger_word: self.trigger_word,
            prompt: self.prompt,
        }
    }
}

#[derive(FromRow)]
struct AnswerRow {
    connection_id: i32,
    question_id: i32,
    prompt: String,
    first_answer: String,
    second_answer: String,
    asked_at: DateTime<Utc>,
}
impl AnswerRow {
    fn to_domain(self) -> AnswerRecord {
        AnswerRecord {
            connection_id: ConnectionId(self.connection_id),
            question_id: QuestionId(self.question_id),
            prompt: self.prompt,
            first_answer: self.first_answer,
            second_answer: self.second_answer,
            asked_at: self.asked_at,
        }
    }
}

const PAIRING_SELECT: &str = "SELECT c.connection_id, f.user_id AS first_id, s.user_id AS second_id \
     FROM connections c \
     JOIN users f ON f.connection_id = c.connection_id AND f.pair_order = 1 \
     JOIN users s ON s.connection_id = c.connection_id AND s.pair_order = 2";

const CHAT_COLUMNS: &str = "chat_id, writer_id, text_body, write_time, is_file, is_image, is_deleted";

//=========================================================================================
// Port Implementations
//=========================================================================================

#[async_trait]
impl IdentityResolver for DbAdapter {
    async fn resolve_identity(&self, token: &str) -> PortResult<Identity> {
        let identity = Identity::parse(token).ok_or(PortError::Unauthorized)?;
        let known: Option<Uuid> = sqlx::query_scalar("SELECT user_id FROM users WHERE user_id = $1")
            .bind(identity.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        known.map(Identity::new).ok_or(PortError::Unauthorized)
    }
}

#[async_trait]
impl PairingDirectory for DbAdapter {
    async fn resolve_pairing(&self, identity: Identity) -> PortResult<Pairing> {
        let sql = format!(
            "{} JOIN users me ON me.connection_id = c.connection_id WHERE me.user_id = $1",
            PAIRING_SELECT
        );
        sqlx::query_as::<_, PairingRecord>(&sql)
            .bind(identity.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?
            .map(PairingRecord::to_domain)
            .ok_or_else(|| PortError::NotFound(format!("No connection for {}", identity)))
    }

    async fn order_of(&self, identity: Identity) -> PortResult<PairOrder> {
        let order: Option<Option<i16>> =
            sqlx::query_scalar("SELECT pair_order FROM users WHERE user_id = $1")
                .bind(identity.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(persistence)?;
        match order.flatten() {
            Some(1) => Ok(PairOrder::First),
            Some(2) => Ok(PairOrder::Second),
            _ => Err(PortError::NotFound(format!("No pair order for {}", identity))),
        }
    }

    async fn pairing_by_connection(&self, connection_id: ConnectionId) -> PortResult<Pairing> {
        let sql = format!("{} WHERE c.connection_id = $1", PAIRING_SELECT);
        sqlx::query_as::<_, PairingRecord>(&sql)
            .bind(connection_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?
            .map(PairingRecord::to_domain)
            .ok_or_else(|| PortError::NotFound(format!("Connection {} not found", connection_id)))
    }

    async fn delete_connection(&self, pairing: &Pairing) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(persistence)?;

        sqlx::query("DELETE FROM chats WHERE writer_id = $1 OR writer_id = $2")
            .bind(pairing.first.as_uuid())
            .bind(pairing.second.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        sqlx::query("DELETE FROM answers WHERE connection_id = $1")
            .bind(pairing.connection_id.0)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        sqlx::query("UPDATE users SET connection_id = NULL, pair_order = NULL WHERE connection_id = $1")
            .bind(pairing.connection_id.0)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        sqlx::query("DELETE FROM connections WHERE connection_id = $1")
            .bind(pairing.connection_id.0)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;

        tx.commit().await.map_err(persistence)
    }
}

#[async_trait]
impl MessageStore for DbAdapter {
    async fn insert(&self, message: NewChatMessage) -> PortResult<MessageId> {
        let chat_id: i32 = sqlx::query_scalar(
            "INSERT INTO chats (writer_id, text_body, write_time, is_file, is_image) \
             VALUES ($1, $2, $3, $4, $5) RETURNING chat_id",
        )
        .bind(message.sender.as_uuid())
        .bind(&message.text_body)
        .bind(&message.write_time)
        .bind(message.is_file)
        .bind(message.is_image)
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(MessageId(chat_id))
    }

    async fn find_message(&self, message_id: MessageId) -> PortResult<Option<ChatMessage>> {
        let sql = format!("SELECT {} FROM chats WHERE chat_id = $1", CHAT_COLUMNS);
        let record = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(record.map(ChatRecord::to_domain))
    }

    async fn soft_delete(&self, message_id: MessageId) -> PortResult<()> {
        let result = sqlx::query("UPDATE chats SET is_deleted = TRUE WHERE chat_id = $1")
            .bind(message_id.0)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Message {} not found", message_id)));
        }
        Ok(())
    }

    async fn list_by_connection(
        &self,
        first: Identity,
        second: Identity,
    ) -> PortResult<Vec<ChatMessage>> {
        let sql = format!(
            "SELECT {} FROM chats WHERE writer_id = $1 OR writer_id = $2 ORDER BY chat_id ASC",
            CHAT_COLUMNS
        );
        let records = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(first.as_uuid())
            .bind(second.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn pending_question_for_order(
        &self,
        order: PairOrder,
        connection_id: ConnectionId,
    ) -> PortResult<Option<QuestionId>> {
        let sql = format!(
            "SELECT question_id FROM answers WHERE connection_id = $1 AND {} = '' \
             ORDER BY asked_at ASC LIMIT 1",
            order_column(order)
        );
        let question_id: Option<i32> = sqlx::query_scalar(&sql)
            .bind(connection_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(question_id.map(QuestionId))
    }

    async fn latest_file_message(&self, sender: Identity) -> PortResult<Option<ChatMessage>> {
        let sql = format!(
            "SELECT {} FROM chats WHERE writer_id = $1 AND is_file ORDER BY chat_id DESC LIMIT 1",
            CHAT_COLUMNS
        );
        let record = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(sender.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(record.map(ChatRecord::to_domain))
    }
}

#[async_trait]
impl QuestionCatalog for DbAdapter {
    async fn stream_questions(&self) -> PortResult<QuestionStream> {
        let pool = self.pool.clone();
        let stream = async_stream::stream! {
            let mut rows = sqlx::query_as::<_, QuestionRecord>(
                "SELECT question_id, trigger_word, prompt FROM questions ORDER BY question_id ASC",
            )
            .fetch(&pool);
            while let Some(row) = rows.next().await {
                yield row.map(QuestionRecord::to_domain).map_err(persistence);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn find_question(&self, question_id: QuestionId) -> PortResult<Question> {
        sqlx::query_as::<_, QuestionRecord>(
            "SELECT question_id, trigger_word, prompt FROM questions WHERE question_id = $1",
        )
        .bind(question_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?
        .map(QuestionRecord::to_domain)
        .ok_or_else(|| PortError::NotFound(format!("Question {} not found", question_id)))
    }
}

#[async_trait]
impl AnswerStore for DbAdapter {
    async fn exists(&self, connection_id: ConnectionId, question_id: QuestionId) -> PortResult<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM answers WHERE connection_id = $1 AND question_id = $2)",
        )
        .bind(connection_id.0)
        .bind(question_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)
    }

    async fn insert(
        &self,
        asked_at: DateTime<Utc>,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO answers (connection_id, question_id, asked_at) VALUES ($1, $2, $3) \
             ON CONFLICT (connection_id, question_id) DO NOTHING",
        )
        .bind(connection_id.0)
        .bind(question_id.0)
        .bind(asked_at)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }

    async fn update_first(
        &self,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        self.update_answer(PairOrder::First, text, connection_id, question_id)
            .await
    }

    async fn update_second(
        &self,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        self.update_answer(PairOrder::Second, text, connection_id, question_id)
            .await
    }

    async fn list_for_connection(&self, connection_id: ConnectionId) -> PortResult<Vec<AnswerRecord>> {
        let records = sqlx::query_as::<_, AnswerRow>(
            "SELECT a.connection_id, a.question_id, q.prompt, a.first_answer, a.second_answer, a.asked_at \
             FROM answers a JOIN questions q ON q.question_id = a.question_id \
             WHERE a.connection_id = $1 ORDER BY a.asked_at ASC",
        )
        .bind(connection_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }
}

impl DbAdapter {
    async fn update_answer(
        &self,
        order: PairOrder,
        text: &str,
        connection_id: ConnectionId,
        question_id: QuestionId,
    ) -> PortResult<()> {
        let sql = format!(
            "UPDATE answers SET {} = $1 WHERE connection_id = $2 AND question_id = $3",
            order_column(order)
        );
        sqlx::query(&sql)
            .bind(text)
            .bind(connection_id.0)
            .bind(question_id.0)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(())
    }
}
