//! services/api/src/web/relay_task.rs
//!
//! The chat relay: classifies each inbound entry, persists it through the
//! matching collaborator, fans it out to whichever of the two parties are live
//! right now, and hands ordinary text to the question engine.

use crate::web::{
    protocol::{wire_timestamp, ChatEntry, Outbound},
    question_task::QuestionEngine,
    registry::SessionRegistry,
    state::SessionContext,
};
use chrono::{FixedOffset, Utc};
use couple_chat_core::{
    ports::{BlobStore, MessageStore},
    NewChatMessage, Pairing,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How an inbound entry is handled, decided by its flags in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Answer,
    Delete,
    FileContinuation,
    Text,
}

impl MessageClass {
    pub fn classify(entry: &ChatEntry) -> Self {
        if entry.is_answer {
            MessageClass::Answer
        } else if entry.is_deleted {
            MessageClass::Delete
        } else if entry.is_file {
            MessageClass::FileContinuation
        } else {
            MessageClass::Text
        }
    }
}

pub struct ChatRelay {
    registry: Arc<SessionRegistry>,
    messages: Arc<dyn MessageStore>,
    blobs: Arc<dyn BlobStore>,
    questions: Arc<QuestionEngine>,
    clock_offset: FixedOffset,
}

impl ChatRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        messages: Arc<dyn MessageStore>,
        blobs: Arc<dyn BlobStore>,
        questions: Arc<QuestionEngine>,
        clock_offset: FixedOffset,
    ) -> Self {
        Self {
            registry,
            messages,
            blobs,
            questions,
            clock_offset,
        }
    }

    /// Processes one inbound frame. Entries are handled in order, one at a time.
    pub async fn handle_inbound(&self, ctx: &SessionContext, entries: Vec<ChatEntry>) {
        if entries.is_empty() {
            debug!(identity = %ctx.identity, "Empty chat frame ignored");
        }
        for entry in entries {
            self.relay_entry(ctx, entry).await;
        }
    }

    /// Classifies, persists, fans out and inspects a single entry.
    pub async fn relay_entry(&self, ctx: &SessionContext, mut entry: ChatEntry) {
        let class = MessageClass::classify(&entry);
        let deliver = match class {
            MessageClass::Answer => {
                self.questions.record_answer(ctx, &entry).await;
                false
            }
            MessageClass::Delete => self.delete_message(ctx, &entry).await,
            MessageClass::FileContinuation => self.attach_file(ctx, &mut entry).await,
            MessageClass::Text => {
                self.persist_text(ctx, &mut entry).await;
                true
            }
        };

        if deliver {
            self.deliver(&ctx.pairing, Outbound::single(entry.clone()))
                .await;
        }

        if class == MessageClass::Text {
            if let Some(question) = self.questions.on_chat_text(ctx, &entry.text_body).await {
                self.deliver(&ctx.pairing, Outbound::single(question)).await;
            }
        }
    }

    /// Writes the frame to each party of the pairing that is registered at this moment.
    /// Absent parties are skipped; a dead session is closed and released.
    /// Returns the number of sessions written to.
    pub async fn deliver(&self, pairing: &Pairing, frame: Outbound) -> usize {
        let mut delivered = 0;
        for member in pairing.members() {
            let Some(session) = self.registry.lookup(member).await else {
                debug!(identity = %member, "Party not connected, delivery skipped");
                continue;
            };
            match session.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(identity = %member, "Dropping dead session: {}", e);
                    session.close();
                    self.registry.release(&session).await;
                }
            }
        }
        delivered
    }

    async fn persist_text(&self, ctx: &SessionContext, entry: &mut ChatEntry) {
        entry.writer_id = ctx.identity.to_string();
        if entry.write_time.is_empty() {
            entry.write_time = wire_timestamp(Utc::now(), self.clock_offset);
        }
        let message = NewChatMessage {
            text_body: entry.text_body.clone(),
            sender: ctx.identity,
            write_time: entry.write_time.clone(),
            is_file: false,
            is_image: false,
        };
        match self.messages.insert(message).await {
            Ok(id) => entry.chat_id = id.0,
            // Fan-out still happens; the entry just carries no id.
            Err(e) => error!(
                identity = %ctx.identity,
                connection_id = %ctx.connection_id(),
                "Failed to persist chat message: {}", e
            ),
        }
    }

    async fn delete_message(&self, ctx: &SessionContext, entry: &ChatEntry) -> bool {
        let message_id = entry.chat_id();
        if message_id.is_unset() {
            warn!(identity = %ctx.identity, "Delete request without a chat id ignored");
            return false;
        }
        match self.messages.find_message(message_id).await {
            Ok(Some(message)) if ctx.pairing.order_of(message.sender).is_some() => {}
            Ok(_) => {
                warn!(
                    identity = %ctx.identity,
                    chat_id = %message_id,
                    "Delete request for a message outside the connection ignored"
                );
                return false;
            }
            Err(e) => {
                error!(chat_id = %message_id, "Failed to look up message to delete: {}", e);
                return false;
            }
        }

        if entry.is_file {
            match self.blobs.remove_for_message(message_id).await {
                Ok(count) => debug!(chat_id = %message_id, "Removed {} blob(s)", count),
                Err(e) => warn!(chat_id = %message_id, "Failed to remove blob: {}", e),
            }
        }
        if let Err(e) = self.messages.soft_delete(message_id).await {
            error!(chat_id = %message_id, "Failed to mark message deleted: {}", e);
        }
        info!(identity = %ctx.identity, chat_id = %message_id, "Message deleted");
        true
    }

    /// Completes a file message uploaded out of band: the entry takes the id and
    /// stored name of the sender's most recent file message.
    async fn attach_file(&self, ctx: &SessionContext, entry: &mut ChatEntry) -> bool {
        match self.messages.latest_file_message(ctx.identity).await {
            Ok(Some(message)) => {
                entry.chat_id = message.id.0;
                entry.text_body = message.text_body;
                entry.is_image = message.is_image;
                entry.writer_id = ctx.identity.to_string();
                if entry.write_time.is_empty() {
                    entry.write_time = message.write_time;
                }
                true
            }
            Ok(None) => {
                warn!(identity = %ctx.identity, "File frame without an uploaded file ignored");
                false
            }
            Err(e) => {
                error!(identity = %ctx.identity, "Failed to look up uploaded file: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::registry::SessionHandle;
    use crate::web::testing::MemoryStore;
    use couple_chat_core::{ConnectionId, Identity, MessageId, PairOrder, QuestionId};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<SessionRegistry>,
        relay: ChatRelay,
        pairing: Pairing,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let pairing = store.pair(7);
        let offset = FixedOffset::east_opt(9 * 3600).unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let questions = Arc::new(QuestionEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            offset,
        ));
        let relay = ChatRelay::new(registry.clone(), store.clone(), store.clone(), questions, offset);
        Harness {
            store,
            registry,
            relay,
            pairing,
        }
    }

    impl Harness {
        fn ctx(&self, order: PairOrder) -> SessionContext {
            let identity = match order {
                PairOrder::First => self.pairing.first,
                PairOrder::Second => self.pairing.second,
            };
            SessionContext {
                identity,
                pairing: self.pairing.clone(),
                order,
            }
        }

        async fn connect(&self, identity: Identity) -> (SessionHandle, UnboundedReceiver<Outbound>) {
            let (handle, rx) = SessionHandle::new(identity);
            self.registry.register(handle.clone()).await;
            (handle, rx)
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ChatEntry> {
        let mut entries = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Chat(chat) = frame {
                entries.extend(chat);
            }
        }
        entries
    }

    fn text(body: &str) -> ChatEntry {
        ChatEntry {
            text_body: body.to_string(),
            write_time: "2024/01/01 10:00".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn classification_follows_flag_priority() {
        let mut entry = ChatEntry {
            is_answer: true,
            is_deleted: true,
            is_file: true,
            ..Default::default()
        };
        assert_eq!(MessageClass::classify(&entry), MessageClass::Answer);
        entry.is_answer = false;
        assert_eq!(MessageClass::classify(&entry), MessageClass::Delete);
        entry.is_deleted = false;
        assert_eq!(MessageClass::classify(&entry), MessageClass::FileContinuation);
        entry.is_file = false;
        assert_eq!(MessageClass::classify(&entry), MessageClass::Text);
    }

    #[tokio::test]
    async fn text_is_persisted_and_each_live_party_gets_one_copy() {
        let h = harness();
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let (_b, mut b_rx) = h.connect(h.pairing.second).await;

        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![text("hello")])
            .await;

        let a_got = drain(&mut a_rx);
        let b_got = drain(&mut b_rx);
        assert_eq!(a_got.len(), 1);
        assert_eq!(b_got.len(), 1);
        assert_eq!(a_got[0], b_got[0]);
        assert_ne!(a_got[0].chat_id, 0);
        assert_eq!(a_got[0].writer_id, h.pairing.first.to_string());

        let stored = h.store.message(MessageId(a_got[0].chat_id)).unwrap();
        assert_eq!(stored.text_body, "hello");
        assert_eq!(stored.sender, h.pairing.first);
    }

    #[tokio::test]
    async fn absent_partner_is_skipped() {
        let h = harness();
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;

        let delivered = h
            .relay
            .deliver(&h.pairing, Outbound::single(text("solo")))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(h.registry.lookup(h.pairing.second).await.is_none());
    }

    #[tokio::test]
    async fn delivery_uses_the_latest_registration() {
        let h = harness();
        let (_a, _a_rx) = h.connect(h.pairing.first).await;
        let (_old_b, mut old_b_rx) = h.connect(h.pairing.second).await;
        let (_new_b, mut new_b_rx) = h.connect(h.pairing.second).await;

        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![text("hi")])
            .await;

        assert!(drain(&mut old_b_rx).is_empty());
        assert_eq!(drain(&mut new_b_rx).len(), 1);
    }

    #[tokio::test]
    async fn dead_peer_is_released_and_sender_still_receives() {
        let h = harness();
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let (_b, b_rx) = h.connect(h.pairing.second).await;
        drop(b_rx);

        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![text("still here?")])
            .await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(h.registry.lookup(h.pairing.second).await.is_none());
        assert!(h.registry.lookup(h.pairing.first).await.is_some());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_fan_out() {
        let h = harness();
        h.store.state().fail_message_inserts = true;
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let (_b, mut b_rx) = h.connect(h.pairing.second).await;

        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![text("offline db")])
            .await;

        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].chat_id, 0);
        assert_eq!(drain(&mut a_rx).len(), 1);
    }

    #[tokio::test]
    async fn answers_are_recorded_but_never_fanned_out() {
        let h = harness();
        h.store.add_question(3, "marry", "Where?");
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let (_b, mut b_rx) = h.connect(h.pairing.second).await;

        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![text("will you marry me")])
            .await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let answer = ChatEntry {
            text_body: "At the beach".into(),
            is_answer: true,
            question_id: 3,
            ..Default::default()
        };
        h.relay
            .handle_inbound(&h.ctx(PairOrder::Second), vec![answer])
            .await;

        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
        let row = h.store.answer(ConnectionId(7), QuestionId(3)).unwrap();
        assert_eq!(row.second_answer, "At the beach");
    }

    #[tokio::test]
    async fn trigger_word_sends_question_to_both_once() {
        let h = harness();
        h.store.add_question(3, "marry", "Where would you like the wedding?");
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let (_b, mut b_rx) = h.connect(h.pairing.second).await;

        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![text("will you marry me")])
            .await;

        for rx in [&mut a_rx, &mut b_rx] {
            let got = drain(rx);
            assert_eq!(got.len(), 2);
            assert_eq!(got[0].text_body, "will you marry me");
            assert_eq!(got[1].question_id, 3);
            assert_eq!(got[1].writer_id, "question");
            assert!(got[1].is_answer);
        }

        h.relay
            .handle_inbound(&h.ctx(PairOrder::Second), vec![text("marry? yes")])
            .await;
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_file_message_removes_its_blob() {
        let h = harness();
        let id = h.store.add_message(h.pairing.first, "photo.png", true);
        h.store.add_blob(&format!("{}-photo.png", id));
        h.store.add_blob("99-other.txt");
        let (_b, mut b_rx) = h.connect(h.pairing.second).await;

        let delete = ChatEntry {
            is_deleted: true,
            is_file: true,
            chat_id: id.0,
            ..Default::default()
        };
        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![delete])
            .await;

        assert!(h.store.message(id).unwrap().is_deleted);
        assert_eq!(h.store.state().blobs, vec!["99-other.txt".to_string()]);
        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert!(got[0].is_deleted);
    }

    #[tokio::test]
    async fn delete_of_another_connections_message_is_refused() {
        let h = harness();
        let stranger = h.store.pair(8);
        let id = h.store.add_message(stranger.first, "their.png", true);
        h.store.add_blob(&format!("{}-their.png", id));
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;

        let delete = ChatEntry {
            is_deleted: true,
            is_file: true,
            chat_id: id.0,
            ..Default::default()
        };
        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![delete])
            .await;

        assert!(!h.store.message(id).unwrap().is_deleted);
        assert_eq!(h.store.state().blobs, vec![format!("{}-their.png", id)]);
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn delete_without_chat_id_is_ignored() {
        let h = harness();
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let delete = ChatEntry {
            is_deleted: true,
            ..Default::default()
        };
        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![delete])
            .await;
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn file_frame_takes_id_and_name_of_latest_upload() {
        let h = harness();
        h.store.add_message(h.pairing.first, "old.pdf", true);
        let latest = h.store.add_message(h.pairing.first, "notes.txt", true);
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;

        let file = ChatEntry {
            is_file: true,
            write_time: "2024/01/01 10:00".into(),
            ..Default::default()
        };
        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![file])
            .await;

        let got = drain(&mut a_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].chat_id, latest.0);
        assert_eq!(got[0].text_body, "notes.txt");
    }

    #[tokio::test]
    async fn file_frame_without_upload_is_ignored() {
        let h = harness();
        let (_a, mut a_rx) = h.connect(h.pairing.first).await;
        let file = ChatEntry {
            is_file: true,
            ..Default::default()
        };
        h.relay
            .handle_inbound(&h.ctx(PairOrder::First), vec![file])
            .await;
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn entries_of_one_frame_are_relayed_in_order() {
        let h = harness();
        let (_b, mut b_rx) = h.connect(h.pairing.second).await;

        h.relay
            .handle_inbound(
                &h.ctx(PairOrder::First),
                vec![text("one"), text("two"), text("three")],
            )
            .await;

        let bodies: Vec<String> = drain(&mut b_rx).into_iter().map(|e| e.text_body).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }
}
