use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tracing::{debug, info};

use wagate_core::InstanceEvent;

use crate::error::ApiError;
use crate::server::AppState;

/// Each instance event becomes one unnamed SSE frame whose data is the event
/// JSON, e.g. `{"event":"qr","data":{"qrcode":"..."}}`. The stream ends when
/// the instance is removed.
pub(crate) async fn instance_events(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let subscription = state.manager.subscribe(&name)?;
    info!(instance = %name, subscriber = %subscription.id(), "sse subscriber attached");

    let stream = subscription.map(|event: InstanceEvent| {
        debug!(kind = event.kind(), "sse event");
        Event::default().json_data(&event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.sse_keepalive)))
}
