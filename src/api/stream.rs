use crate::api::AuthContext;
use crate::bus::EVENT_NOTIFICATION;
use crate::state::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Extension, Router};
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/stream", get(stream))
}

/// Long-lived change-hint stream. Browsers refetch the named resource on
/// every `update` event; delivery is best-effort.
async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.bus.subscribe(&auth.user_id);

    let hello = futures::stream::once(async {
        Ok::<Event, Infallible>(Event::default().event("hello").data("{}"))
    });
    let updates = subscription.map(|bus_event| {
        let name = if bus_event.event_type == EVENT_NOTIFICATION {
            "notification"
        } else {
            "update"
        };
        let data = serde_json::to_string(&bus_event).unwrap_or_else(|_| "{}".to_string());
        Ok::<Event, Infallible>(Event::default().event(name).data(data))
    });

    Sse::new(hello.chain(updates))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}
