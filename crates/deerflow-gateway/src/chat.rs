//! Chat handlers for both streaming endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use deerflow_agent::{EventStream, RequestOptions, Runner, SupervisorAgent, feedback_message};

use crate::adapter::thread_chat::{new_thread_id, unconfigured_frame};
use crate::adapter::{ChatCompletionsEncoder, ThreadChatEncoder, pump, sse_response};
use crate::state::GatewayState;

/// Response header carrying the thread id of a `/v1/chat/completions` run.
pub const THREAD_ID_HEADER: &str = "x-thread-id";

#[derive(Debug, Clone, Deserialize)]
pub struct InputMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct CompletionsRequest {
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    /// Thread to resume; a fresh one is minted when absent.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Answer to a pending interrupt: `accepted` or `edit_plan`.
    #[serde(default)]
    pub interrupt_feedback: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ThreadChatRequest {
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub locale: String,
    /// Answer to a pending interrupt: `accepted` or `edit_plan`.
    #[serde(default)]
    pub interrupt_feedback: Option<String>,
    #[serde(default)]
    pub auto_accepted_plan: bool,
    #[serde(default)]
    pub max_step_num: Option<u32>,
    #[serde(default)]
    pub max_plan_iterations: Option<u32>,
    #[serde(default = "default_true")]
    pub enable_background_investigation: bool,
}

/// Content of the last user message, if it has any.
pub fn last_user_query(messages: &[InputMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .filter(|content| !content.is_empty())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn build(state: &GatewayState, options: &RequestOptions) -> Result<Arc<SupervisorAgent>, Response> {
    state.factory.build(options).map_err(|e| {
        error!(%e, "Failed to assemble agents");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    payload: Result<Json<CompletionsRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(query) = last_user_query(&request.messages) else {
        return error_response(StatusCode::BAD_REQUEST, "no user message found");
    };

    let thread_id = request
        .thread_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_thread_id);

    let supervisor = match build(&state, &RequestOptions::default()) {
        Ok(supervisor) => supervisor,
        Err(response) => return response,
    };

    let cancel = state.shutdown.child_token();
    let feedback = request.interrupt_feedback.as_deref();
    let runner = Runner::new(supervisor);
    let events = start_run(&state, runner, &thread_id, query, feedback, &cancel).await;

    let checkpoints = state.checkpoints.clone();
    let header = HeaderValue::from_str(&thread_id);
    let mut response = sse_response(cancel, move |tx| async move {
        let mut encoder = ChatCompletionsEncoder::new();
        if let Some(resume) = pump(events, &mut encoder, &tx).await {
            checkpoints.save(thread_id, resume).await;
        }
    });
    match header {
        Ok(value) => {
            response.headers_mut().insert(THREAD_ID_HEADER, value);
        }
        Err(e) => warn!(%e, "Thread id is not a valid header value"),
    }
    response
}

/// Resume the suspended run of `thread_id` when feedback answers it,
/// otherwise start a new run for `query`.
async fn start_run(
    state: &GatewayState,
    runner: Runner,
    thread_id: &str,
    query: &str,
    feedback: Option<&str>,
    cancel: &CancellationToken,
) -> EventStream {
    let feedback = feedback.filter(|f| !f.is_empty());
    let checkpoint = match feedback {
        Some(_) => state.checkpoints.take(thread_id).await,
        None => None,
    };
    match (checkpoint, feedback) {
        (Some(resume), Some(option)) => {
            info!(thread_id, option, "Resuming suspended run");
            runner.resume(resume, feedback_message(option, query), cancel.clone())
        }
        _ => {
            if feedback.is_some() {
                warn!(thread_id, "No suspended run for interrupt feedback, starting over");
            }
            info!(thread_id, query_len = query.len(), "Chat request");
            runner.query(query, cancel.clone())
        }
    }
}

/// `POST /api/chat/stream`
pub async fn thread_chat(
    State(state): State<Arc<GatewayState>>,
    payload: Result<Json<ThreadChatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(query) = last_user_query(&request.messages) else {
        return error_response(StatusCode::BAD_REQUEST, "no user message found");
    };
    let thread_id = if request.thread_id.is_empty() {
        new_thread_id()
    } else {
        request.thread_id.clone()
    };

    if !state.factory.has_credentials() {
        warn!(thread_id = %thread_id, "Model credentials missing, answering with setup notice");
        return sse_response(CancellationToken::new(), move |tx| async move {
            let _ = tx.send(unconfigured_frame(&thread_id)).await;
        });
    }

    let options = RequestOptions {
        max_step_num: request.max_step_num,
        max_plan_iterations: request.max_plan_iterations,
        auto_accepted_plan: request.auto_accepted_plan,
        enable_background_investigation: request.enable_background_investigation,
        locale: Some(request.locale.clone()).filter(|l| !l.is_empty()),
        streaming: true,
    };
    let supervisor = match build(&state, &options) {
        Ok(supervisor) => supervisor,
        Err(response) => return response,
    };
    let cancel = state.shutdown.child_token();
    let feedback = request.interrupt_feedback.as_deref();
    let runner = Runner::new(supervisor);
    let events = start_run(&state, runner, &thread_id, query, feedback, &cancel).await;

    let checkpoints = state.checkpoints.clone();
    sse_response(cancel, move |tx| async move {
        let mut encoder = ThreadChatEncoder::new(thread_id);
        if let Some(resume) = pump(events, &mut encoder, &tx).await {
            checkpoints.save(encoder.thread_id(), resume).await;
        }
    })
}
