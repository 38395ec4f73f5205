//! The status web interface: static pages plus a WebSocket through which a
//! browser observes live job state and drives bulk retry/remove.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::job::{Job, JobState};
use crate::server::{Manager, QueueHandle, CMDS_QUEUE};
use crate::shutdown::ShutdownToken;
use crate::store::JobOutput;

/// What the status page sends over the WebSocket.
///
/// `Key` alone asks for one job's detail. Otherwise `Request` selects the
/// operation and the remaining fields act as selectors.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct StatusRequest {
    key: String,
    rep_group: String,
    state: String,
    exitcode: i32,
    fail_reason: String,
    all: bool,
    request: String,
}

/// Job detail as the status page expects it, durations in seconds.
#[derive(Clone, Debug, Serialize)]
pub struct JStatus {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "RepGroup")]
    pub rep_group: String,
    #[serde(rename = "Cmd")]
    pub cmd: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Cwd")]
    pub cwd: String,
    #[serde(rename = "ExpectedRAM")]
    pub expected_ram: u32,
    #[serde(rename = "ExpectedTime")]
    pub expected_time: f64,
    #[serde(rename = "Cores")]
    pub cores: u32,
    #[serde(rename = "PeakRAM")]
    pub peak_ram: u32,
    #[serde(rename = "Exited")]
    pub exited: bool,
    #[serde(rename = "Exitcode")]
    pub exitcode: i32,
    #[serde(rename = "FailReason")]
    pub fail_reason: String,
    #[serde(rename = "Pid")]
    pub pid: u32,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Walltime")]
    pub walltime: f64,
    #[serde(rename = "CPUtime")]
    pub cpu_time: f64,
    #[serde(rename = "StdErr")]
    pub stderr: String,
    #[serde(rename = "StdOut")]
    pub stdout: String,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "Attempts")]
    pub attempts: u32,
    #[serde(rename = "Similar")]
    pub similar: usize,
}

impl JStatus {
    fn new(job: &Job, output: &JobOutput, similar: usize) -> Self {
        Self {
            key: job.key.clone(),
            rep_group: job.rep_group.clone(),
            cmd: job.cmd.clone(),
            state: job.state.as_str().to_string(),
            cwd: job.cwd.clone(),
            expected_ram: job.requirements.ram_mb,
            expected_time: job.requirements.time.as_secs_f64(),
            cores: job.requirements.cores,
            peak_ram: job.peak_ram_mb,
            exited: job.exited,
            exitcode: job.exit_code,
            fail_reason: job.fail_reason.clone(),
            pid: job.pid,
            host: job.host.clone(),
            walltime: job.walltime.as_secs_f64(),
            cpu_time: job.cpu_time.as_secs_f64(),
            stderr: output.stderr.clone(),
            stdout: output.stdout.clone(),
            env: job.env.clone(),
            attempts: job.attempts,
            similar,
        }
    }
}

/// Per-group state count sent for snapshots; `From` is `"new"`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct JStateCount {
    rep_group: String,
    from: String,
    to: String,
    count: usize,
}

#[derive(Clone)]
struct WebState {
    manager: Arc<Manager>,
}

/// Build the status router: static documents everywhere, the WebSocket on
/// `/ws`.
pub fn router(manager: Arc<Manager>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .fallback(static_handler)
        .layer(cors)
        .with_state(WebState { manager })
}

/// Bind and serve the status interface until shutdown.
pub fn spawn(
    manager: Arc<Manager>,
    addr: SocketAddr,
    shutdown: ShutdownToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(manager);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(addr = %addr, error = %err, "failed to bind status interface");
                return;
            }
        };
        tracing::info!(addr = %addr, "status interface listening");
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(err) = server.await {
            tracing::error!(error = %err, "status interface failed");
        }
    })
}

/// Map a request path to a document and its content type. The home page is
/// `/status.html`.
async fn static_handler(uri: Uri) -> Response {
    let path = rewrite_path(uri.path());
    match asset(&path) {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&path))],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn rewrite_path(path: &str) -> String {
    if path == "/" || path == "/status" {
        "/status.html".to_string()
    } else {
        path.to_string()
    }
}

fn asset(path: &str) -> Option<&'static str> {
    match path {
        "/status.html" => Some(include_str!("static/status.html")),
        _ => None,
    }
}

fn content_type_for(path: &str) -> &'static str {
    if path.starts_with("/js") {
        "application/json; charset=utf-8"
    } else if path.starts_with("/css") {
        "text/css; charset=utf-8"
    } else if path.starts_with("/fonts") {
        if path.ends_with(".eot") {
            "application/vnd.ms-fontobject"
        } else if path.ends_with(".svg") {
            "image/svg+xml"
        } else if path.ends_with(".ttf") {
            "application/x-font-truetype"
        } else if path.ends_with(".woff") {
            "application/font-woff"
        } else if path.ends_with(".woff2") {
            "application/font-woff2"
        } else {
            "application/octet-stream"
        }
    } else if path.ends_with("favicon.ico") {
        "image/x-icon"
    } else {
        "text/html; charset=utf-8"
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.manager))
}

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// One status connection: a writer task forwards broadcaster events while
/// this task reads requests; both share the sink under a mutex.
async fn handle_socket(socket: WebSocket, manager: Arc<Manager>) {
    let conn_id = uuid::Uuid::new_v4();
    tracing::debug!(conn_id = %conn_id, "status socket connected");
    let (sink, mut stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    let mut events = manager.subscribe_status();
    let writer_sink = sink.clone();
    let writer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if writer_sink
                        .lock()
                        .await
                        .send(Message::Text(text))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status socket lagged; events dropped");
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(request) = serde_json::from_str::<StatusRequest>(&text) else {
            continue;
        };
        handle_request(&manager, &sink, request).await;
    }

    // reader gone (browser refresh or close); the writer has no socket left
    writer.abort();
    tracing::debug!(conn_id = %conn_id, "status socket disconnected");
}

async fn handle_request(manager: &Arc<Manager>, sink: &SharedSink, request: StatusRequest) {
    let handle = manager.handle(CMDS_QUEUE);

    if !request.key.is_empty() {
        if let Some((job, output)) = manager.job_detail(&handle, &request.key) {
            send_json(sink, &JStatus::new(&job, &output, 0)).await;
        }
        return;
    }

    match request.request.as_str() {
        "current" => send_current(manager, &handle, sink).await,
        "details" => send_details(manager, &handle, sink, &request).await,
        "retry" => {
            manager.retry_matching(
                &handle,
                &request.rep_group,
                request.exitcode,
                &request.fail_reason,
                request.all,
            );
        }
        "remove" => {
            manager
                .remove_matching(
                    &handle,
                    &request.rep_group,
                    request.exitcode,
                    &request.fail_reason,
                    request.all,
                )
                .await;
        }
        _ => {}
    }
}

/// The `+all+` snapshot, then one state-count set per reporting group
/// (queued jobs plus archived completions).
async fn send_current(manager: &Arc<Manager>, handle: &QueueHandle, sink: &SharedSink) {
    let jobs = manager.get_incomplete(handle);
    if !send_group_state_count(sink, "+all+", &jobs).await {
        return;
    }

    let mut by_group: HashMap<String, Vec<Job>> = HashMap::new();
    for job in jobs {
        by_group.entry(job.rep_group.clone()).or_default().push(job);
    }
    for (rep_group, mut jobs) in by_group {
        jobs.extend(manager.get_complete(&rep_group));
        if !send_group_state_count(sink, &rep_group, &jobs).await {
            return;
        }
    }
}

/// One example jstatus per distinct `(state, exit code, fail reason)`
/// grouping within the requested group.
async fn send_details(
    manager: &Arc<Manager>,
    handle: &QueueHandle,
    sink: &SharedSink,
    request: &StatusRequest,
) {
    let state = parse_state(&request.state);
    for (job, similar) in manager.examples_by_rep_group(handle, &request.rep_group, state) {
        let output = manager
            .job_detail(handle, &job.key)
            .map(|(_, output)| output)
            .unwrap_or_default();
        let mut status = JStatus::new(&job, &output, similar);
        // report the group the user asked about, not the job's latest label
        status.rep_group = request.rep_group.clone();
        if !send_json(sink, &status).await {
            return;
        }
    }
}

async fn send_group_state_count(sink: &SharedSink, rep_group: &str, jobs: &[Job]) -> bool {
    for (sub_queue, count) in state_counts(jobs) {
        let sent = send_json(
            sink,
            &JStateCount {
                rep_group: rep_group.to_string(),
                from: "new".to_string(),
                to: sub_queue,
                count,
            },
        )
        .await;
        if !sent {
            return false;
        }
    }
    true
}

/// Collapse job states onto the sub-queues the status page groups by.
fn state_counts(jobs: &[Job]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for job in jobs {
        *counts
            .entry(job.state.sub_queue().to_string())
            .or_insert(0) += 1;
    }
    counts
}

fn parse_state(state: &str) -> Option<JobState> {
    match state {
        "delayed" | "delay" => Some(JobState::Delayed),
        "ready" => Some(JobState::Ready),
        "reserved" => Some(JobState::Reserved),
        "running" | "run" => Some(JobState::Running),
        "buried" | "bury" => Some(JobState::Buried),
        "dependent" => Some(JobState::Dependent),
        "complete" => Some(JobState::Complete),
        _ => None,
    }
}

async fn send_json<T: Serialize>(sink: &SharedSink, value: &T) -> bool {
    let Ok(text) = serde_json::to_string(value) else {
        return false;
    };
    sink.lock().await.send(Message::Text(text)).await.is_ok()
}
