//! services/api/src/web/state.rs
//!
//! Defines the application's shared and session-specific states.

use crate::config::Config;
use crate::web::{
    question_task::QuestionEngine, registry::SessionRegistry, relay_task::ChatRelay,
    teardown_task::TeardownScheduler,
};
use couple_chat_core::ports::{
    AnswerStore, BlobStore, IdentityResolver, MessageStore, PairingDirectory, PortResult,
    QuestionCatalog,
};
use couple_chat_core::{ConnectionId, Identity, PairOrder, Pairing};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The external collaborators the real-time core is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub identities: Arc<dyn IdentityResolver>,
    pub directory: Arc<dyn PairingDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub catalog: Arc<dyn QuestionCatalog>,
    pub answers: Arc<dyn AnswerStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identities: Arc<dyn IdentityResolver>,
    pub directory: Arc<dyn PairingDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub answers: Arc<dyn AnswerStore>,
    pub registry: Arc<SessionRegistry>,
    pub relay: Arc<ChatRelay>,
    pub questions: Arc<QuestionEngine>,
    pub teardown: Arc<TeardownScheduler>,
}

impl AppState {
    /// Wires the registry, relay, trigger engine and teardown scheduler onto the collaborators.
    pub fn new(config: Arc<Config>, ports: Collaborators) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let questions = Arc::new(QuestionEngine::new(
            ports.catalog.clone(),
            ports.answers.clone(),
            ports.messages.clone(),
            config.clock_offset,
        ));
        let relay = Arc::new(ChatRelay::new(
            registry.clone(),
            ports.messages.clone(),
            ports.blobs.clone(),
            questions.clone(),
            config.clock_offset,
        ));
        let teardown = Arc::new(TeardownScheduler::new(
            config.teardown_grace,
            ports.directory.clone(),
            ports.messages.clone(),
            ports.blobs.clone(),
            questions.clone(),
            registry.clone(),
        ));

        Self {
            config,
            identities: ports.identities,
            directory: ports.directory,
            messages: ports.messages,
            answers: ports.answers,
            registry,
            relay,
            questions,
            teardown,
        }
    }
}

//=========================================================================================
// SessionContext (Specific to One WebSocket Connection)
//=========================================================================================

/// What one session learns about its connection when it is established.
/// Looked up once; the live sessions themselves are always looked up fresh.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub identity: Identity,
    pub pairing: Pairing,
    pub order: PairOrder,
}

impl SessionContext {
    /// Consults the pairing directory for the identity's partner, connection and order.
    pub async fn establish(app_state: &AppState, identity: Identity) -> PortResult<Self> {
        let pairing = app_state.directory.resolve_pairing(identity).await?;
        let order = app_state.directory.order_of(identity).await?;
        Ok(Self {
            identity,
            pairing,
            order,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.pairing.connection_id
    }
}
