//! HTTP server for the ZX16 simulator service.
//!
//! Thin adapter over [`zx16_core::Supervisor`]: each route parses its input,
//! calls one supervisor operation and wraps the result in the JSON envelope.

mod routes;
mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

pub use routes::{status_for, ApiResponse};
pub use state::SharedState;

/// Build the router. Unknown paths fall through to `static_dir` when given.
pub fn router(state: Arc<SharedState>, static_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health))
        .route("/build", post(routes::build))
        .route("/simulate", post(routes::simulate))
        .route("/step", post(routes::step))
        .route("/stop", post(routes::stop))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(
    state: Arc<SharedState>,
    addr: SocketAddr,
    static_dir: Option<PathBuf>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, static_dir);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        log::error!("Failed to bind HTTP server to {}: {}", addr, e);
        e
    })?;

    log::info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;
    use zx16_core::gateway::{BuildCapability, BuildOutcome, CompilationGateway};
    use zx16_core::{SimulatorConfig, Supervisor};

    const BOUNDARY: &str = "zx16-test-boundary";

    struct StubGateway {
        executable_found: bool,
    }

    impl CompilationGateway for StubGateway {
        fn capability(&self) -> BuildCapability {
            BuildCapability {
                executable_found: self.executable_found,
                source_found: false,
                compiler_available: true,
                executable_path: "/opt/z16sim".to_string(),
            }
        }

        fn build(&self) -> BuildOutcome {
            BuildOutcome {
                success: true,
                message: "unused".to_string(),
            }
        }
    }

    fn app_with(config: SimulatorConfig, executable_found: bool) -> Router {
        let gateway = Arc::new(StubGateway { executable_found });
        let supervisor = Arc::new(Supervisor::new(config, gateway));
        router(Arc::new(SharedState::new(supervisor)), None)
    }

    fn app() -> Router {
        app_with(SimulatorConfig::default(), false)
    }

    fn multipart(file: Option<(&str, &[u8])>, mode: Option<&str>) -> Request<Body> {
        let mut body = Vec::new();
        if let Some((name, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"binfile\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(mode) = mode {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"mode\"\r\n\r\n{mode}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::post("/simulate")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, ApiResponse) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    mod health {
        use super::*;

        #[tokio::test]
        async fn reports_capability() {
            let request = Request::get("/health").body(Body::empty()).unwrap();
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.success);
            let data = body.data.unwrap();
            assert_eq!(data["executable_found"], false);
            assert_eq!(data["compiler_available"], true);
            assert_eq!(data["executable_path"], "/opt/z16sim");
            assert_eq!(data["active_sessions"], 0);
        }
    }

    mod build {
        use super::*;

        #[tokio::test]
        async fn missing_source_is_precondition() {
            let request = Request::post("/build").body(Body::empty()).unwrap();
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::PRECONDITION_FAILED);
            assert!(!body.success);
            assert_eq!(body.kind.as_deref(), Some("precondition"));
        }
    }

    mod simulate {
        use super::*;

        #[tokio::test]
        async fn missing_file_is_rejected() {
            let (status, body) = call(app(), multipart(None, Some("step"))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body.kind.as_deref(), Some("validation"));
            assert!(body.error.unwrap().contains("No file uploaded"));
        }

        #[tokio::test]
        async fn wrong_extension_is_rejected() {
            let request = multipart(Some(("prog.txt", &[0, 0])), None);
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body.kind.as_deref(), Some("validation"));
        }

        #[tokio::test]
        async fn unknown_mode_is_rejected() {
            let request = multipart(Some(("prog.bin", &[0, 0])), Some("turbo"));
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.error.unwrap().contains("turbo"));
        }

        #[tokio::test]
        async fn missing_executable_is_precondition() {
            let uploads = tempfile::tempdir().unwrap();
            let app = app_with(SimulatorConfig::default().upload_dir(uploads.path()), false);
            let request = multipart(Some(("prog.bin", &[0xC7, 0x00])), Some("step"));
            let (status, body) = call(app, request).await;
            assert_eq!(status, StatusCode::PRECONDITION_FAILED);
            assert_eq!(body.kind.as_deref(), Some("precondition"));
            assert!(body.error.unwrap().contains("/opt/z16sim"));
            assert_eq!(std::fs::read_dir(uploads.path()).unwrap().count(), 0);
        }
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn step_unknown_session_is_not_found() {
            let request = json_post("/step", r#"{"session_id": "nope"}"#);
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body.kind.as_deref(), Some("not_found"));
        }

        #[tokio::test]
        async fn step_with_bad_body_is_validation() {
            let request = json_post("/step", r#"{"id": 1}"#);
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body.kind.as_deref(), Some("validation"));
        }

        #[tokio::test]
        async fn stop_unknown_session_succeeds() {
            let request = json_post("/stop", r#"{"session_id": "nope"}"#);
            let (status, body) = call(app(), request).await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.success);
            assert_eq!(
                body.data.unwrap(),
                serde_json::json!({"status": "already_stopped"})
            );
        }
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const SIM: &str = r#"#!/bin/sh
echo "Starting interactive simulation."
echo READY_FOR_STEP
n=0
while read cmd; do
  [ "$cmd" = q ] && exit 0
  n=$((n+1))
  echo "step $n"
  if [ $n -ge 2 ]; then echo "Simulation halted."; exit 0; fi
  echo READY_FOR_STEP
done
"#;

        #[tokio::test]
        async fn step_session_over_http() {
            let bin = tempfile::tempdir().unwrap();
            let uploads = tempfile::tempdir().unwrap();
            let exe = bin.path().join("z16sim");
            std::fs::write(&exe, SIM).unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

            let app = app_with(
                SimulatorConfig::new(&exe).upload_dir(uploads.path()),
                true,
            );

            let request = multipart(Some(("prog.bin", &[0xB9, 0x05, 0xC7, 0x00])), Some("step"));
            let (status, body) = call(app.clone(), request).await;
            assert_eq!(status, StatusCode::OK, "{:?}", body.error);
            let data = body.data.unwrap();
            assert_eq!(data["mode"], "step");
            let session_id = data["session_id"].as_str().unwrap().to_string();
            let step_body = format!(r#"{{"session_id": "{}"}}"#, session_id);

            let (status, body) = call(app.clone(), json_post("/step", &step_body)).await;
            assert_eq!(status, StatusCode::OK);
            let data = body.data.unwrap();
            assert_eq!(data["step_count"], 1);
            assert_eq!(data["terminated"], false);
            assert_eq!(data["output"], "step 1\n");

            let (_, body) = call(app.clone(), json_post("/step", &step_body)).await;
            assert_eq!(body.data.unwrap()["terminated"], true);

            let (status, _) = call(app.clone(), json_post("/step", &step_body)).await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            let (_, body) = call(app, json_post("/stop", &step_body)).await;
            assert_eq!(body.data.unwrap()["status"], "already_stopped");
            assert_eq!(std::fs::read_dir(uploads.path()).unwrap().count(), 0);
        }
    }
}
