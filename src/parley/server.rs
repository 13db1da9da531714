//! HTTP streaming surface for live debates.
//!
//! Three endpoints, mounted by [`router`]:
//!
//! - `POST /api/debate/stream/start`: validate the request, register a
//!   [`DebateRun`], spawn the orchestrator worker, reply `202` with the run
//!   id.
//! - `GET /api/debate/stream?run_id=...`: `text/event-stream` of the run;
//!   one `start` event, a `turn` event per appended turn, then exactly one
//!   of `complete`, `stopped`, or `debate_error`.
//! - `POST /api/debate/stream/stop`: request cancellation of a run.
//!
//! Request bodies are parsed strictly: unknown fields, trailing JSON values,
//! and bodies over 2 MiB are rejected.  Subscribers run a snapshot+wait loop
//! against the run's update signal, so the producing worker never blocks on
//! a slow client.

use crate::parley::broker::{DebateRun, RunBroker, RunError, RunStart, DEFAULT_TURN_BUFFER};
use crate::parley::hooks::{Clock, PersonaLoader, ResultSink, SystemClock};
use crate::parley::orchestrator::Orchestrator;
use crate::parley::persona::{normalize_personas, Persona};
use crate::parley::transcript::Turn;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Hard cap on request-body bytes.
pub const MAX_REQUEST_BYTES: usize = 2 * 1024 * 1024;

/// Shared state behind the streaming endpoints.
pub struct StreamServerState {
    pub broker: Arc<RunBroker>,
    pub orchestrator: Arc<Orchestrator>,
    pub loader: Arc<dyn PersonaLoader>,
    pub sink: Option<Arc<dyn ResultSink>>,
    pub clock: Arc<dyn Clock>,
    pub turn_buffer: usize,
}

impl StreamServerState {
    pub fn new(
        broker: Arc<RunBroker>,
        orchestrator: Arc<Orchestrator>,
        loader: Arc<dyn PersonaLoader>,
    ) -> Self {
        StreamServerState {
            broker,
            orchestrator,
            loader,
            sink: None,
            clock: Arc::new(SystemClock),
            turn_buffer: DEFAULT_TURN_BUFFER,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_turn_buffer(mut self, turn_buffer: usize) -> Self {
        self.turn_buffer = turn_buffer;
        self
    }
}

/// Build the streaming router.
pub fn router(state: Arc<StreamServerState>) -> Router {
    Router::new()
        .route("/api/debate/stream/start", post(start_debate))
        .route("/api/debate/stream", get(stream_debate))
        .route("/api/debate/stream/stop", post(stop_debate))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

fn not_found(run_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown run_id {}", run_id) })),
    )
        .into_response()
}

/// Strict JSON: deny unknown fields (via the target type) and reject any
/// trailing JSON value after the first.
fn parse_strict<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    let mut de = serde_json::Deserializer::from_slice(bytes);
    let value = T::deserialize(&mut de).map_err(|e| e.to_string())?;
    de.end()
        .map_err(|_| "unexpected data after JSON body".to_string())?;
    Ok(value)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartRequest {
    problem: String,
    #[serde(default)]
    persona_path: Option<String>,
    #[serde(default)]
    personas: Option<Vec<Persona>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StopRequest {
    run_id: String,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    run_id: String,
}

async fn start_debate(
    State(state): State<Arc<StreamServerState>>,
    body: Bytes,
) -> Response {
    let request: StartRequest = match parse_strict(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(e),
    };
    let problem = request.problem.trim().to_string();
    if problem.is_empty() {
        return bad_request("problem must not be empty");
    }

    let personas = match (&request.persona_path, request.personas) {
        (Some(_), Some(_)) => {
            return bad_request("provide either persona_path or personas, not both")
        }
        (None, None) => return bad_request("one of persona_path or personas is required"),
        (Some(path), None) => match state.loader.load(Path::new(path)) {
            Ok(p) => p,
            Err(e) => return bad_request(format!("failed to load personas: {}", e)),
        },
        (None, Some(inline)) => match normalize_personas(inline) {
            Ok(p) => p,
            Err(e) => return bad_request(format!("invalid personas: {}", e)),
        },
    };

    let run_id = state.broker.next_run_id(state.clock.now_utc());
    let start = RunStart {
        run_id: run_id.clone(),
        problem: problem.clone(),
        persona_path: request.persona_path.clone(),
        persona_count: personas.len(),
    };
    let run = Arc::new(DebateRun::new(
        start.clone(),
        state.turn_buffer,
        CancellationToken::new(),
    ));
    state.broker.store(Arc::clone(&run));
    log::debug!("run {} started ({} personas)", run_id, personas.len());

    spawn_worker(&state, Arc::clone(&run), problem, personas);

    (StatusCode::ACCEPTED, Json(json!(start))).into_response()
}

/// Drive the orchestrator on a background task, feeding the run object.
fn spawn_worker(
    state: &Arc<StreamServerState>,
    run: Arc<DebateRun>,
    problem: String,
    personas: Vec<Persona>,
) {
    let orchestrator = Arc::clone(&state.orchestrator);
    let sink = state.sink.clone();
    let broker = Arc::clone(&state.broker);
    tokio::spawn(async move {
        let cancel = run.cancel_token();
        let observer_run = Arc::clone(&run);
        let observer: Box<dyn FnMut(&Turn) + Send> =
            Box::new(move |turn: &Turn| observer_run.append_turn(turn.clone()));

        let outcome = orchestrator
            .run(&cancel, &problem, personas, Some(observer))
            .await;

        match outcome.error {
            None => {
                let mut artifacts = None;
                let mut error = None;
                if let Some(sink) = &sink {
                    match sink.save(&outcome.result) {
                        Ok(saved) => artifacts = Some(saved),
                        Err(e) => {
                            log::error!("failed to persist run {}: {}", run.id(), e);
                            error = Some(RunError::Failed(format!("failed to save result: {}", e)));
                        }
                    }
                }
                run.finish(Some(outcome.result), artifacts, error);
            }
            Some(e) if e.is_cancellation() => {
                run.finish(Some(outcome.result), None, Some(RunError::Cancelled));
            }
            Some(e) => {
                log::error!("run {} failed: {}", run.id(), e);
                run.finish(Some(outcome.result), None, Some(RunError::Failed(e.to_string())));
            }
        }
        broker.schedule_expiry(run.id().to_string());
    });
}

async fn stream_debate(
    State(state): State<Arc<StreamServerState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let run = match state.broker.get(&query.run_id) {
        Some(run) => run,
        None => return not_found(&query.run_id),
    };
    Sse::new(run_event_stream(run))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Snapshot+wait loop over one run.
///
/// The receiver is marked seen *before* each snapshot, so an update landing
/// between snapshot and wait re-wakes the loop immediately and nothing is
/// lost.  Cursor jumps across evicted turns are implicit in the adjusted
/// cursor returned by `snapshot`.
fn run_event_stream(
    run: Arc<DebateRun>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut rx = run.subscribe();
        let start_data = serde_json::to_string(run.start_event()).unwrap_or_default();
        yield Ok(Event::default().event("start").data(start_data));

        let mut cursor = 0u64;
        loop {
            let _ = rx.borrow_and_update();
            let snap = run.snapshot(cursor);
            cursor = snap.cursor + snap.turns.len() as u64;
            for turn in &snap.turns {
                let data = serde_json::to_string(turn).unwrap_or_default();
                yield Ok(Event::default().event("turn").data(data));
            }
            if snap.done {
                let run_id = run.id();
                if let Some(error) = snap.error {
                    let data = json!({ "run_id": run_id, "error": error }).to_string();
                    yield Ok(Event::default().event("debate_error").data(data));
                } else if snap.stopped {
                    let data = json!({ "run_id": run_id, "status": "stopped" }).to_string();
                    yield Ok(Event::default().event("stopped").data(data));
                } else {
                    let status = snap
                        .response
                        .as_ref()
                        .map(|r| r.status.as_str())
                        .unwrap_or("error");
                    let mut payload = json!({ "run_id": run_id, "status": status });
                    if let Some(saved) = &snap.artifacts {
                        payload["json_path"] = json!(saved.json_path.display().to_string());
                        payload["markdown_path"] =
                            json!(saved.markdown_path.display().to_string());
                    }
                    yield Ok(Event::default().event("complete").data(payload.to_string()));
                }
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn stop_debate(
    State(state): State<Arc<StreamServerState>>,
    body: Bytes,
) -> Response {
    let request: StopRequest = match parse_strict(&body) {
        Ok(r) => r,
        Err(e) => return bad_request(e),
    };
    let run = match state.broker.get(&request.run_id) {
        Some(run) => run,
        None => return not_found(&request.run_id),
    };
    run.stop();
    log::debug!("run {} stop requested", request.run_id);
    (
        StatusCode::OK,
        Json(json!({ "run_id": request.run_id, "status": "stopping" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parsing_rejects_unknown_fields_and_trailing_values() {
        let ok: Result<StartRequest, _> =
            parse_strict(br#"{"problem":"p","personas":[{"id":"a"},{"id":"b"}]}"#);
        assert!(ok.is_ok());

        let unknown: Result<StartRequest, _> =
            parse_strict(br#"{"problem":"p","extra":1}"#);
        assert!(unknown.is_err());

        let trailing: Result<StopRequest, _> =
            parse_strict(br#"{"run_id":"r"} {"run_id":"x"}"#);
        assert!(trailing.is_err());

        let not_json: Result<StopRequest, _> = parse_strict(b"run_id=r");
        assert!(not_json.is_err());
    }
}
