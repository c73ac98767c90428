//! `POST /api/chat`: SSE streaming (or single-JSON) chat responses.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::AppState;
use crate::chat::ChatRequest;
use crate::events::AgentEvent;

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream") || accept.contains("*/*"))
        .unwrap_or(true)
}

/// Chat entrypoint. With `stream=true` and an SSE-accepting client the
/// response is an event stream; otherwise the assembled result as JSON.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.stream && wants_sse(&headers) {
        let rx = state.chat.chat_stream(request);
        let stream = event_stream(rx);
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    } else {
        let result = state.chat.chat_collect(request).await;
        Json(result).into_response()
    }
}

fn event_stream(
    rx: tokio::sync::mpsc::Receiver<AgentEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    ReceiverStream::new(rx).map(|event| Ok(Event::default().data(event.to_sse_data())))
}
