//! HTTP surface and submission front-end.
//!
//! `POST /execute` admits a request through the rate limiter, builds a job
//! with a deadline of its time limit plus a teardown grace, enqueues it
//! (waiting under backpressure, still bounded by the deadline), and then
//! waits for the first of result, error, or timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::executor::{ExecuteError, ExecuteOptions};
use crate::limiter::RateLimiter;
use crate::metrics;
use crate::queue::{Job, JobQueue};

/// Teardown grace added to the job's time limit to form its deadline.
const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Extra slack the front-end waits past the job deadline so a driver-side
/// time-limit verdict can still reach the client instead of racing the 504.
const REPLY_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
    /// Seconds; 0 means the configured default
    #[serde(default)]
    pub time_limit: u64,
    /// MB; 0 means the configured default
    #[serde(default)]
    pub memory_limit: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: JobQueue,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    // The HTTP ceiling must exceed the largest job deadline plus slack;
    // otherwise long executions get cut off at the transport
    let request_timeout = Duration::from_secs(state.config.request_timeout_secs);
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .route("/metrics", get(metrics_scrape))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_scrape() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::global().render(),
    )
        .into_response()
}

/// Releases the limiter's concurrency slot when the handler returns, on
/// every exit path.
struct ConcurrencySlot(Arc<RateLimiter>);

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Rate-limit key: X-Forwarded-For verbatim when present, else the peer IP.
/// The header is unauthenticated and therefore spoofable; deployments behind
/// a proxy should restrict trust to that proxy.
fn client_key(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

async fn execute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let key = client_key(&headers, addr);
    if !state.limiter.allow(&key) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
    }
    let _slot = ConcurrencySlot(state.limiter.clone());

    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request body").into_response(),
    };

    if req.source_code.len() > state.config.max_source_bytes {
        return (StatusCode::BAD_REQUEST, "Source code too large").into_response();
    }

    let time_limit_secs = if req.time_limit == 0 {
        state.config.default_time_limit_secs
    } else {
        req.time_limit
    };
    let memory_limit_mb = if req.memory_limit == 0 {
        state.config.default_memory_limit_mb
    } else {
        req.memory_limit
    };

    let deadline = Instant::now() + Duration::from_secs(time_limit_secs) + DEADLINE_GRACE;
    let (result_tx, mut result_rx) = oneshot::channel();
    let (error_tx, mut error_rx) = oneshot::channel();
    let job = Job {
        id: format!("job-{}", Uuid::new_v4()),
        opts: ExecuteOptions {
            language: req.language,
            source_code: req.source_code,
            stdin: req.stdin,
            time_limit_ms: time_limit_secs * 1000,
            memory_limit_kb: memory_limit_mb * 1024,
        },
        deadline,
        result_tx,
        error_tx,
    };
    let job_id = job.id.clone();
    debug!(job_id = %job_id, client = %key, "admitted job");

    match tokio::time::timeout_at(deadline, state.queue.submit(job)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Service is shutting down").into_response();
        }
        Err(_) => {
            warn!(job_id = %job_id, "queue submission timed out");
            return (StatusCode::GATEWAY_TIMEOUT, "Execution timed out").into_response();
        }
    }

    // The worker writes exactly one slot and then drops the other, so a
    // closed slot can be observed a hair before the sibling's value; check
    // the sibling before giving up.
    tokio::select! {
        biased;
        res = &mut result_rx => match res {
            Ok(result) => (StatusCode::OK, Json(result)).into_response(),
            Err(_) => match error_rx.try_recv() {
                Ok(err) => internal_error(&job_id, err),
                Err(_) => abandoned(&job_id),
            },
        },
        err = &mut error_rx => match err {
            Ok(err) => internal_error(&job_id, err),
            Err(_) => match result_rx.try_recv() {
                Ok(result) => (StatusCode::OK, Json(result)).into_response(),
                Err(_) => abandoned(&job_id),
            },
        },
        _ = tokio::time::sleep_until(deadline + REPLY_SLACK) => {
            warn!(job_id = %job_id, "execution timed out at the edge");
            (StatusCode::GATEWAY_TIMEOUT, "Execution timed out").into_response()
        }
    }
}

fn internal_error(job_id: &str, err: ExecuteError) -> Response {
    warn!(job_id = %job_id, error = %err, "execution failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

fn abandoned(job_id: &str) -> Response {
    warn!(job_id = %job_id, "job abandoned without a reply");
    (StatusCode::INTERNAL_SERVER_ERROR, "Execution aborted").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::languages::Registry;
    use crate::sandbox::{RunConfig, RunOutput, Sandbox, SandboxError};
    use crate::worker;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tower::ServiceExt;

    /// Sandbox that interprets a handful of known source programs.
    struct ScriptedSandbox;

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn run(&self, cfg: RunConfig, deadline: Instant) -> Result<RunOutput, SandboxError> {
            match cfg.source_code.as_str() {
                "print(1+1)" => Ok(RunOutput {
                    stdout: "2\n".to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                    time_ms: 4,
                    memory_kb: 0,
                }),
                "import sys; sys.exit(3)" => Ok(RunOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 3,
                    time_ms: 2,
                    memory_kb: 0,
                }),
                "while True: pass" => {
                    tokio::time::sleep_until(deadline).await;
                    Err(SandboxError::DeadlineExceeded)
                }
                "int main(){return 0" => Ok(RunOutput {
                    stdout: String::new(),
                    stderr: "solution.cpp:1:18: error: expected '}' at end of input\n"
                        .to_string(),
                    exit_code: 1,
                    time_ms: 0,
                    memory_kb: 0,
                }),
                "import sys;print(sys.stdin.read().upper())" => Ok(RunOutput {
                    stdout: format!("{}\n", cfg.stdin.to_uppercase()),
                    stderr: String::new(),
                    exit_code: 0,
                    time_ms: 3,
                    memory_kb: 0,
                }),
                "boom" => Err(SandboxError::Internal("engine exploded".to_string())),
                _ => Ok(RunOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                    time_ms: 1,
                    memory_kb: 0,
                }),
            }
        }

        async fn ensure_image(&self, _image: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            port: 0,
            request_timeout_secs: 30,
            queue_capacity: 16,
            worker_count: 2,
            global_rps: 1000.0,
            per_client_rps: 1000.0,
            per_client_burst: 1000,
            max_concurrent: 100,
            cleanup_interval_secs: 300,
            max_source_bytes: 1024,
            default_time_limit_secs: 2,
            default_memory_limit_mb: 256,
            shutdown_grace_secs: 5,
        }
    }

    fn test_app(config: Config, limiter: RateLimiter) -> (Router, watch::Sender<bool>) {
        let registry = Arc::new(Registry::with_defaults().unwrap());
        let executor = Arc::new(Executor::new(registry, Arc::new(ScriptedSandbox)));
        let (queue, job_rx) = JobQueue::new(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        worker::spawn_pool(config.worker_count, executor, job_rx, shutdown_rx);

        let state = AppState {
            config: Arc::new(config),
            queue,
            limiter: Arc::new(limiter),
        };
        let app = router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        (app, shutdown_tx)
    }

    fn wide_open_limiter() -> RateLimiter {
        RateLimiter::new(1000.0, 1000.0, 1000, 100)
    }

    fn post_execute(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn successful_execution_returns_the_result() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(
                json!({"language": "python", "source_code": "print(1+1)"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Status"], "success");
        assert_eq!(body["Stdout"], "2\n");
        assert_eq!(body["ExitCode"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_runtime_error() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(
                json!({"language": "python", "source_code": "import sys; sys.exit(3)"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Status"], "runtime_error");
        assert_eq!(body["ExitCode"], 3);
    }

    #[tokio::test]
    async fn unknown_language_is_classified_not_a_500() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(
                json!({"language": "ruby", "source_code": "puts 1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Status"], "error");
        assert_eq!(body["ErrorType"], "Invalid Language");
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_loop_hits_the_time_limit() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(json!({
                "language": "python",
                "source_code": "while True: pass",
                "time_limit": 1,
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Status"], "error");
        assert_eq!(body["ErrorType"], "Time Limit Exceeded");
    }

    #[tokio::test]
    async fn compile_failure_is_a_program_outcome() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(
                json!({"language": "cpp", "source_code": "int main(){return 0"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["Status"], "runtime_error");
        assert_ne!(body["ExitCode"], 0);
        assert!(body["Stderr"].as_str().unwrap().contains("error"));
    }

    #[tokio::test]
    async fn stdin_reaches_the_program() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(json!({
                "language": "python",
                "source_code": "import sys;print(sys.stdin.read().upper())",
                "stdin": "hi",
            })))
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["Stdout"], "HI\n");
    }

    #[tokio::test]
    async fn sandbox_failure_is_a_500() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(post_execute(
                json!({"language": "python", "source_code": "boom"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn malformed_body_is_a_400() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/execute")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_source_is_a_400() {
        let mut config = test_config();
        config.max_source_bytes = 8;
        let (app, _shutdown) = test_app(config, wide_open_limiter());

        let response = app
            .oneshot(post_execute(
                json!({"language": "python", "source_code": "print(1+1) # padding"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_method_is_a_405() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/execute")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn rate_limited_request_is_a_429() {
        // Global burst of 2, so the third request in the same instant is shed
        let (app, _shutdown) = test_app(test_config(), RateLimiter::new(1.0, 1000.0, 1000, 100));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post_execute(
                    json!({"language": "python", "source_code": "print(1+1)"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(post_execute(
                json!({"language": "python", "source_code": "print(1+1)"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn forwarded_for_header_keys_the_per_client_bucket() {
        // Per-client burst of 1; distinct X-Forwarded-For values get their
        // own buckets
        let (app, _shutdown) = test_app(test_config(), RateLimiter::new(1000.0, 1.0, 1, 100));

        let request = |xff: &str| {
            Request::builder()
                .method("POST")
                .uri("/execute")
                .header("content-type", "application/json")
                .header("x-forwarded-for", xff)
                .body(Body::from(
                    json!({"language": "python", "source_code": "print(1+1)"}).to_string(),
                ))
                .unwrap()
        };

        let first = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = app.oneshot(request("10.0.0.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_the_registry() {
        let (app, _shutdown) = test_app(test_config(), wide_open_limiter());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("crucible_queue_depth"));
        assert!(text.contains("crucible_rate_limit_hits_total"));
    }
}
