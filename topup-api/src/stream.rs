use crate::state::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;

/// Live order changes for the tenant. Lagged receivers skip what they missed.
pub async fn order_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe(&state.tenant_id);
    tracing::debug!("SSE subscriber attached for tenant {}", state.tenant_id);

    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().event("order").data(json))),
                Err(e) => {
                    tracing::error!("Failed to encode order event: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("SSE subscriber lagged: {}", e);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
