//! Server-Sent Events stream for tailing task logs.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Extension;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::Deserialize;
use tracing::debug;

use crate::routes::ApiError;
use crate::state::{AppState, RequestId};

/// Period between store polls while a client is attached.
const TAIL_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    /// Only stream entries strictly after this RFC3339 timestamp.
    from: Option<String>,
}

/// GET /api/v1/tasks/{id}/logs - stream log entries as SSE.
///
/// Emits a `connected` event, replays entries after the cursor, then keeps
/// polling the store and pushing new entries until the client disconnects.
pub async fn task_logs(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut cursor: Option<DateTime<Utc>> = match &query.from {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|err| {
                    ApiError::validation(format!("invalid from timestamp: {err}"), &request_id)
                })?,
        ),
        None => None,
    };

    // Reject unknown tasks up front instead of holding an empty stream open.
    state
        .service
        .get_task(&id)
        .await
        .map_err(|err| ApiError::from_service(err, &request_id))?;

    let service = state.service.clone();
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match service.tail_logs(&id, cursor).await {
                Ok(entries) => {
                    for entry in entries {
                        cursor = Some(entry.timestamp);
                        if let Ok(json) = serde_json::to_string(&entry) {
                            yield Ok(Event::default().event("log").data(json));
                        }
                    }
                }
                Err(err) => {
                    debug!(error = %err, "log tail stopped");
                    break;
                }
            }
            tokio::time::sleep(TAIL_POLL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")))
}
