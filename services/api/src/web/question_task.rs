//! services/api/src/web/question_task.rs
//!
//! The keyword-triggered question engine. Ordinary chat text is scanned for
//! catalog trigger words; the first matching question not yet asked in the
//! connection is recorded and returned as a synthetic chat entry. Answer-flagged
//! messages are written into the sender's answer column.

use crate::web::{
    protocol::{wire_timestamp, ChatEntry},
    state::SessionContext,
};
use chrono::{FixedOffset, Utc};
use couple_chat_core::{
    ports::{AnswerStore, MessageStore, PortResult, QuestionCatalog},
    ConnectionId, PairOrder, Question, QuestionId,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to an answer-flagged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// The sender's column was overwritten.
    Recorded(PairOrder),
    /// No question was asked for this connection and id; the answer is dropped.
    Dropped,
    /// The answer store failed.
    Failed,
}

pub struct QuestionEngine {
    catalog: Arc<dyn QuestionCatalog>,
    answers: Arc<dyn AnswerStore>,
    messages: Arc<dyn MessageStore>,
    /// In-memory copy of the catalog, in catalog order. `None` until first loaded.
    snapshot: RwLock<Option<Arc<Vec<Question>>>>,
    /// Questions known to be asked, per connection. Each set guards check-then-insert.
    claims: Mutex<HashMap<ConnectionId, Arc<Mutex<HashSet<QuestionId>>>>>,
    clock_offset: FixedOffset,
}

impl QuestionEngine {
    pub fn new(
        catalog: Arc<dyn QuestionCatalog>,
        answers: Arc<dyn AnswerStore>,
        messages: Arc<dyn MessageStore>,
        clock_offset: FixedOffset,
    ) -> Self {
        Self {
            catalog,
            answers,
            messages,
            snapshot: RwLock::new(None),
            claims: Mutex::new(HashMap::new()),
            clock_offset,
        }
    }

    /// Reloads the catalog. On failure the previous snapshot stays in place.
    pub async fn refresh_catalog(&self) -> PortResult<usize> {
        let mut stream = self.catalog.stream_questions().await?;
        let mut questions = Vec::new();
        while let Some(question) = stream.next().await {
            questions.push(question?);
        }
        let count = questions.len();
        *self.snapshot.write().await = Some(Arc::new(questions));
        Ok(count)
    }

    /// The current catalog snapshot, loading it on first use.
    pub async fn catalog(&self) -> Arc<Vec<Question>> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return snapshot.clone();
        }
        if let Err(e) = self.refresh_catalog().await {
            warn!("Failed to load question catalog: {}", e);
        }
        self.snapshot.read().await.clone().unwrap_or_default()
    }

    /// Inspects an ordinary chat message. Returns the synthetic question entry to relay,
    /// at most one per message and at most once per `(connection, question)`.
    pub async fn on_chat_text(&self, ctx: &SessionContext, text: &str) -> Option<ChatEntry> {
        let candidates: Vec<Question> = self
            .catalog()
            .await
            .iter()
            .filter(|q| q.is_triggered_by(text))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let connection_id = ctx.connection_id();
        let claims = self.claims_of(connection_id).await;
        let mut asked = claims.lock().await;
        for question in candidates {
            if asked.contains(&question.id) {
                continue;
            }
            match self.answers.exists(connection_id, question.id).await {
                Ok(true) => {
                    asked.insert(question.id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(connection_id = %connection_id, "Failed to check asked questions: {}", e);
                    return None;
                }
            }

            let asked_at = Utc::now();
            if let Err(e) = self.answers.insert(asked_at, connection_id, question.id).await {
                // Left unclaimed so a later trigger asks again.
                error!(
                    connection_id = %connection_id,
                    question_id = %question.id,
                    "Failed to persist asked question: {}", e
                );
                return None;
            }
            asked.insert(question.id);
            info!(
                connection_id = %connection_id,
                question_id = %question.id,
                trigger = %question.trigger_word,
                "Trigger word matched, asking question"
            );
            return Some(ChatEntry::question(
                question.id,
                &question.prompt,
                wire_timestamp(asked_at, self.clock_offset),
            ));
        }
        None
    }

    /// The claim set of one connection. Its lock serializes triggers within the
    /// connection only.
    async fn claims_of(&self, connection_id: ConnectionId) -> Arc<Mutex<HashSet<QuestionId>>> {
        self.claims
            .lock()
            .await
            .entry(connection_id)
            .or_default()
            .clone()
    }

    /// Writes an answer-flagged message into the sender's column of an existing Answer row.
    pub async fn record_answer(&self, ctx: &SessionContext, entry: &ChatEntry) -> AnswerOutcome {
        let connection_id = ctx.connection_id();
        let question_id = entry.question_id();
        if question_id.is_unset() {
            debug!(identity = %ctx.identity, "Answer without a question id dropped");
            return AnswerOutcome::Dropped;
        }

        match self.answers.exists(connection_id, question_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    connection_id = %connection_id,
                    question_id = %question_id,
                    "Answer for a question never asked here, dropped"
                );
                return AnswerOutcome::Dropped;
            }
            Err(e) => {
                error!(connection_id = %connection_id, "Failed to look up answer row: {}", e);
                return AnswerOutcome::Failed;
            }
        }

        let result = match ctx.order {
            PairOrder::First => {
                self.answers
                    .update_first(&entry.text_body, connection_id, question_id)
                    .await
            }
            PairOrder::Second => {
                self.answers
                    .update_second(&entry.text_body, connection_id, question_id)
                    .await
            }
        };
        match result {
            Ok(()) => {
                info!(
                    connection_id = %connection_id,
                    question_id = %question_id,
                    order = ?ctx.order,
                    "Answer recorded"
                );
                AnswerOutcome::Recorded(ctx.order)
            }
            Err(e) => {
                error!(connection_id = %connection_id, "Failed to record answer: {}", e);
                AnswerOutcome::Failed
            }
        }
    }

    /// The question this party has been asked but not answered yet, for re-delivery
    /// when the party reconnects.
    pub async fn pending_question(&self, ctx: &SessionContext) -> Option<ChatEntry> {
        let question_id = match self
            .messages
            .pending_question_for_order(ctx.order, ctx.connection_id())
            .await
        {
            Ok(Some(question_id)) => question_id,
            Ok(None) => return None,
            Err(e) => {
                warn!(identity = %ctx.identity, "Failed to look up pending question: {}", e);
                return None;
            }
        };

        let cached = self
            .catalog()
            .await
            .iter()
            .find(|q| q.id == question_id)
            .cloned();
        let question = match cached {
            Some(question) => question,
            None => match self.catalog.find_question(question_id).await {
                Ok(question) => question,
                Err(e) => {
                    warn!(question_id = %question_id, "Pending question missing from catalog: {}", e);
                    return None;
                }
            },
        };

        Some(ChatEntry::question(
            question.id,
            &question.prompt,
            wire_timestamp(Utc::now(), self.clock_offset),
        ))
    }

    /// Drops the in-memory claims of a connection that no longer exists.
    pub async fn forget_connection(&self, connection_id: ConnectionId) {
        self.claims.lock().await.remove(&connection_id);
    }
}

/// Background worker that keeps the catalog snapshot fresh until shutdown.
pub async fn catalog_refresh_process(
    engine: Arc<QuestionEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!("Catalog refresh process started.");
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Catalog refresh process cancelled.");
                return;
            }
            _ = ticker.tick() => {
                match engine.refresh_catalog().await {
                    Ok(count) => debug!("Question catalog refreshed with {} entries", count),
                    Err(e) => warn!("Question catalog refresh failed, keeping previous snapshot: {}", e),
                }
            }
        }
    }
}
