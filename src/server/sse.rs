//! Live log stream for one application.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::debug;

use super::api::{ApiError, SharedState, load_app};
use crate::events::{LogHub, LogKind, StreamMessage};
use crate::runtime::ContainerRuntime;

/// Aborts the container log tail when the client goes away.
struct TailTask(Option<JoinHandle<()>>);

impl Drop for TailTask {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Follow a container's output into the hub, one message per line.
fn spawn_tail(
    hub: Arc<LogHub>,
    runtime: Arc<dyn ContainerRuntime>,
    app_id: String,
    container_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut logs = match runtime.container_logs(&container_id, true).await {
            Ok(logs) => logs,
            Err(e) => {
                hub.log(&app_id, LogKind::Error, format!("Cannot follow container logs: {}", e));
                return;
            }
        };
        let mut pending = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(bytes) => {
                    pending.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = pending.find('\n') {
                        let line: String = pending.drain(..=pos).collect();
                        let line = line.trim_end();
                        if !line.is_empty() {
                            hub.log(&app_id, LogKind::ContainerLog, line);
                        }
                    }
                }
                Err(e) => {
                    debug!(app_id = %app_id, error = %e, "Container log stream ended");
                    break;
                }
            }
        }
        let rest = pending.trim_end();
        if !rest.is_empty() {
            hub.log(&app_id, LogKind::ContainerLog, rest);
        }
    })
}

pub async fn stream_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let app = load_app(&state, &id).await?;
    let mut subscription = state.hub.subscribe(&app.id);

    let tail = TailTask(match &app.container_id {
        Some(container_id) => match state.runtimes.runtime(app.runtime_type).await {
            Ok(runtime) => Some(spawn_tail(
                Arc::clone(&state.hub),
                runtime,
                app.id.clone(),
                container_id.clone(),
            )),
            Err(e) => {
                debug!(app_id = %app.id, error = %e, "No backend to tail container logs");
                None
            }
        },
        None => None,
    });
    let connected = StreamMessage::Connected(format!("Connected to logs for {}", app.id))
        .to_json()
        .to_string();

    let stream = async_stream::stream! {
        let _tail = tail;
        yield Ok(Event::default().data(connected));
        while let Some(json) = subscription.recv().await {
            yield Ok(Event::default().data(json));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
