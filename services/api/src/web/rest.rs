//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::error::TeardownError;
use crate::web::{
    state::{AppState, SessionContext},
    teardown_task::{RollbackOutcome, TeardownState},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use couple_chat_core::{Identity, PortError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        disconnect_handler,
        rollback_handler,
        teardown_status_handler,
        list_answers_handler,
    ),
    components(
        schemas(DisconnectResponse, TeardownStatusResponse, TeardownState, AnswerView, ErrorBody)
    ),
    tags(
        (name = "Couple Chat API", description = "Connection lifecycle and answer history for the real-time chat.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct DisconnectResponse {
    connection_id: i32,
    grace_secs: u64,
}

#[derive(Serialize, ToSchema)]
pub struct TeardownStatusResponse {
    connection_id: i32,
    state: TeardownState,
}

/// One asked question, seen from the caller's side of the connection.
#[derive(Serialize, ToSchema, Debug, PartialEq)]
pub struct AnswerView {
    pub question_id: i32,
    pub prompt: String,
    pub my_answer: String,
    pub partner_answer: String,
    pub asked_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    code: String,
    message: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

fn reject(status: StatusCode, code: &'static str, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: message.into(),
        }),
    )
}

/// Resolves the caller's connection, mapping port failures onto HTTP statuses.
async fn caller_context(app_state: &AppState, identity: Identity) -> ApiResult<SessionContext> {
    SessionContext::establish(app_state, identity)
        .await
        .map_err(|e| match e {
            PortError::NotFound(message) => reject(StatusCode::NOT_FOUND, "NO_CONNECTION", message),
            PortError::Unauthorized => reject(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Unknown identity"),
            PortError::Persistence(message) => {
                error!(identity = %identity, "Failed to resolve connection: {}", message);
                reject(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "Failed to resolve connection")
            }
        })
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Schedule the teardown of the caller's connection after the grace period.
#[utoipa::path(
    post,
    path = "/connection/disconnect",
    responses(
        (status = 200, description = "Teardown scheduled", body = DisconnectResponse),
        (status = 404, description = "Caller has no connection", body = ErrorBody),
        (status = 409, description = "A teardown is already pending", body = ErrorBody)
    )
)]
pub async fn disconnect_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<DisconnectResponse>> {
    let ctx = caller_context(&app_state, identity).await?;
    let connection_id = ctx.connection_id();

    app_state
        .teardown
        .request_disconnect(connection_id)
        .await
        .map_err(|e| match e {
            TeardownError::AlreadyPending(_) => {
                reject(StatusCode::CONFLICT, "ALREADY_PENDING", e.to_string())
            }
        })?;

    info!(identity = %identity, connection_id = %connection_id, "Disconnect requested");
    Ok(Json(DisconnectResponse {
        connection_id: connection_id.0,
        grace_secs: app_state.teardown.grace().as_secs(),
    }))
}

/// Cancel a pending teardown of the caller's connection.
#[utoipa::path(
    post,
    path = "/connection/rollback",
    responses(
        (status = 200, description = "Pending teardown cancelled"),
        (status = 204, description = "Nothing was pending"),
        (status = 404, description = "Caller has no connection", body = ErrorBody)
    )
)]
pub async fn rollback_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Response> {
    let ctx = caller_context(&app_state, identity).await?;
    let status = match app_state.teardown.rollback(ctx.connection_id()).await {
        RollbackOutcome::Cancelled => StatusCode::OK,
        RollbackOutcome::NothingPending => StatusCode::NO_CONTENT,
    };
    Ok(status.into_response())
}

/// Report whether a teardown of the caller's connection is pending or running.
#[utoipa::path(
    get,
    path = "/connection/teardown",
    responses(
        (status = 200, description = "Current teardown state", body = TeardownStatusResponse),
        (status = 404, description = "Caller has no connection", body = ErrorBody)
    )
)]
pub async fn teardown_status_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<TeardownStatusResponse>> {
    let ctx = caller_context(&app_state, identity).await?;
    let state = app_state.teardown.state(ctx.connection_id()).await;
    Ok(Json(TeardownStatusResponse {
        connection_id: ctx.connection_id().0,
        state,
    }))
}

/// List every question asked on the caller's connection with both answers.
#[utoipa::path(
    get,
    path = "/answers",
    responses(
        (status = 200, description = "Asked questions, oldest first", body = [AnswerView]),
        (status = 404, description = "Caller has no connection", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody)
    )
)]
pub async fn list_answers_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<AnswerView>>> {
    let ctx = caller_context(&app_state, identity).await?;
    let mut records = app_state
        .answers
        .list_for_connection(ctx.connection_id())
        .await
        .map_err(|e| {
            error!(connection_id = %ctx.connection_id(), "Failed to list answers: {}", e);
            reject(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "Failed to list answers")
        })?;
    records.sort_by_key(|record| record.asked_at);

    let views = records
        .into_iter()
        .map(|record| AnswerView {
            question_id: record.question_id.0,
            my_answer: record.answer_of(ctx.order).to_string(),
            partner_answer: record.answer_of(ctx.order.other()).to_string(),
            prompt: record.prompt,
            asked_at: record.asked_at,
        })
        .collect();
    Ok(Json(views))
}
