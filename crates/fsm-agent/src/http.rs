use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use fsm_core::{ResourceKey, ServerStatus, ServerVersion};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::{
    config::ConfigStore,
    error_payload, fanout,
    fanout::Subscription,
    mods::{self, ModDownloader},
    progress::ProgressRegistry,
    server_versions::{self, ServerInstaller},
    supervisor::Supervisor,
    support::format_error_chain,
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub supervisor: Supervisor,
    pub progress: ProgressRegistry,
    pub servers: ServerInstaller,
    pub mods: ModDownloader,
}

pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "invalid_param" => StatusCode::BAD_REQUEST,
        "binary_not_found" | "version_not_installed" | "mod_not_found"
        | "mod_version_not_found" => StatusCode::NOT_FOUND,
        "not_configured" | "install_in_progress" | "mod_already_installed" => StatusCode::CONFLICT,
        "missing_credentials" => StatusCode::PRECONDITION_FAILED,
        "fetch_failed" | "upstream_status" | "integrity_mismatch" | "checksum_unavailable" => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = error_payload::from_error(&self.0);
        let status = status_for(&payload.code);
        if status.is_server_error() {
            tracing::warn!(code = %payload.code, error = %format_error_chain(&self.0), "request failed");
        }
        (status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/server/status", get(server_status))
        .route("/api/server/start", post(server_start))
        .route("/api/server/stop", post(server_stop))
        .route("/api/server/version", get(server_version))
        .route("/api/server/logs", get(server_logs))
        .route("/api/server/config/init", post(config_init))
        .route("/api/versions", get(versions_list))
        .route(
            "/api/versions/:branch/:version",
            post(version_install).delete(version_uninstall),
        )
        .route("/api/versions/:branch/:version/select", post(version_select))
        .route("/api/versions/:branch/:version/progress", get(version_progress))
        .route("/api/mods", get(mods_list))
        .route("/api/mod-list/:name", put(mod_set_enabled))
        .route(
            "/api/mods/:name/:version",
            post(mod_download).delete(mod_delete),
        )
        .route("/api/mods/:name/:version/install", post(mod_install))
        .route("/api/mods/:name/:version/uninstall", post(mod_uninstall))
        .route("/api/mods/:name/:version/progress", get(mod_progress))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn server_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.supervisor.status().await)
}

async fn server_version(State(state): State<AppState>) -> Json<ServerVersion> {
    Json(state.supervisor.version().await)
}

async fn server_start(State(state): State<AppState>) -> ApiResult<Json<ServerStatus>> {
    state.supervisor.start().await?;
    Ok(Json(state.supervisor.status().await))
}

async fn server_stop(State(state): State<AppState>) -> ApiResult<Json<ServerStatus>> {
    state.supervisor.stop().await?;
    Ok(Json(state.supervisor.status().await))
}

#[derive(Debug, serde::Deserialize)]
struct InitQuery {
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, serde::Serialize)]
struct InitResponse {
    copied: usize,
    is_configured: bool,
}

async fn config_init(
    State(state): State<AppState>,
    Query(q): Query<InitQuery>,
) -> Json<InitResponse> {
    let copied = state.supervisor.initialise_configuration(q.overwrite);
    Json(InitResponse {
        copied,
        is_configured: state.config.current().is_configured(),
    })
}

#[derive(Debug, serde::Serialize)]
struct VersionsResponse {
    available: serde_json::Value,
    installed: std::collections::BTreeMap<String, Vec<String>>,
}

async fn versions_list(State(state): State<AppState>) -> ApiResult<Json<VersionsResponse>> {
    let available = state.servers.latest_releases().await?;
    let cfg = state.config.current();
    Ok(Json(VersionsResponse {
        available,
        installed: server_versions::installed_versions(&cfg.factorio.server_versions)?,
    }))
}

/// Runs the whole install; clients can follow it on the progress socket
/// meanwhile.
async fn version_install(
    State(state): State<AppState>,
    Path((branch, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.servers.install(&branch, &version).await?;
    Ok(StatusCode::CREATED)
}

async fn version_select(
    State(state): State<AppState>,
    Path((branch, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    server_versions::select_version(&state.config, &branch, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn version_uninstall(
    State(state): State<AppState>,
    Path((branch, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    server_versions::uninstall_version(&state.config.current(), &branch, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Serialize)]
struct ModsResponse {
    available: std::collections::BTreeMap<String, Vec<String>>,
    installed: std::collections::BTreeMap<String, Vec<String>>,
}

async fn mods_list(State(state): State<AppState>) -> ApiResult<Json<ModsResponse>> {
    let cfg = state.config.current();
    Ok(Json(ModsResponse {
        available: mods::available_mods(&cfg)?,
        installed: mods::installed_mods(&cfg)?,
    }))
}

async fn mod_download(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.mods.download(&name, &version).await?;
    Ok(StatusCode::CREATED)
}

async fn mod_install(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    mods::install_mod(&state.config.current(), &name, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mod_uninstall(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    mods::uninstall_mod(&state.config.current(), &name, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mod_delete(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    mods::delete_mod(&state.config.current(), &name, &version)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn mod_set_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<StatusCode> {
    mods::set_mod_enabled(&state.config.current().factorio.mods_dir, &name, body.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn server_logs(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let sub = state.supervisor.subscribe_logs();
        let id = sub.id();
        stream_to_socket(socket, sub, Message::Text).await;
        let logs = state.supervisor.logs();
        logs.unsubscribe(id);
        tracing::debug!(subscriber = id, remaining = logs.subscriber_count(), "log stream closed");
    })
}

async fn version_progress(
    State(state): State<AppState>,
    Path((branch, version)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    progress_socket(state.progress, ResourceKey::new(branch, version), ws)
}

async fn mod_progress(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    progress_socket(state.progress, ResourceKey::new(name, version), ws)
}

fn progress_socket(registry: ProgressRegistry, key: ResourceKey, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let sub = registry.subscribe(key.clone());
        let id = sub.id();
        stream_to_socket(socket, sub, |ev| {
            Message::Text(serde_json::to_string(&ev).unwrap_or_default())
        })
        .await;
        registry.unsubscribe(&key, id);
        tracing::debug!(key = %key, subscriber = id, remaining = registry.subscriber_count(&key), "progress stream closed");
    })
}

/// Forwards a subscription to the socket until the client goes away or a
/// write fails.
async fn stream_to_socket<T, F>(socket: WebSocket, sub: Subscription<T>, encode: F)
where
    F: Fn(T) -> Message,
{
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let forward = fanout::forward(sub, |item| {
        let msg = encode(item);
        let sender = sender.clone();
        async move { sender.lock().await.send(msg).await }
    });
    let closed = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = closed => {}
    }
    let _ = sender.lock().await.close().await;
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        config::Config,
        fetch::{Endpoints, Fetcher, test_server::TestServer},
        log_broadcast::LogBroadcaster,
    };

    const NO_UPSTREAM: &str = "http://127.0.0.1:9";

    async fn spawn_app(root: &std::path::Path) -> (String, AppState) {
        spawn_app_with_upstream(root, NO_UPSTREAM).await
    }

    async fn spawn_app_with_upstream(root: &std::path::Path, upstream: &str) -> (String, AppState) {
        let path = root.join("fsm.ini");
        fs::write(
            &path,
            format!(
                "[factorio]\nconfig = {0}/config\ndownloads = {0}/dl\nlogs = {0}/logs\nmods = {0}/mods\nsaves = {0}/saves\nserver_versions = {0}/servers\nbranch = stable\nversion = 1.1.110\n",
                root.display()
            ),
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        crate::config::prepare_layout(&cfg).unwrap();
        let store = ConfigStore::new(cfg);
        let progress = ProgressRegistry::with_capacity(16);
        let fetcher = Fetcher::new().unwrap();
        let endpoints = Endpoints {
            factorio_base: upstream.to_string(),
            mods_base: upstream.to_string(),
        };
        let state = AppState {
            config: store.clone(),
            supervisor: Supervisor::new(store.clone(), LogBroadcaster::with_capacity(16)),
            progress: progress.clone(),
            servers: ServerInstaller::new(store.clone(), fetcher.clone(), endpoints.clone(), progress.clone()),
            mods: ModDownloader::new(store, fetcher, endpoints, progress),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn status_reports_stopped_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _state) = spawn_app(dir.path()).await;

        let status: ServerStatus = reqwest::get(format!("{base}/api/server/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!status.running);
        assert!(!status.can_download);
        assert!(!status.is_configured);
        assert!(status.version.is_unknown());
    }

    #[tokio::test]
    async fn start_errors_carry_code_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _state) = spawn_app(dir.path()).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/api/server/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        let payload: error_payload::ErrorPayload = resp.json().await.unwrap();
        assert_eq!(payload.code, "binary_not_found");

        let resp = client
            .post(format!("{base}/api/versions/stable/9.9.9/select"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn mods_listing_and_enable_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(dir.path()).await;
        let cfg = state.config.current();
        fs::create_dir_all(mods::cache_dir(&cfg)).unwrap();
        fs::write(mods::cache_dir(&cfg).join("Foo_1.0.0.zip"), b"zip").unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/api/mods/Foo/1.0.0/install"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 204);

        let listing: serde_json::Value = client
            .get(format!("{base}/api/mods"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["installed"]["Foo"], serde_json::json!(["1.0.0"]));
        assert_eq!(listing["available"]["Foo"], serde_json::json!(["1.0.0"]));

        let resp = client
            .put(format!("{base}/api/mod-list/Foo"))
            .json(&serde_json::json!({"enabled": false}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 204);
        let list = fs::read_to_string(cfg.factorio.mods_dir.join("mod-list.json")).unwrap();
        assert!(list.contains("\"Foo\""));
    }

    #[tokio::test]
    async fn failed_installs_report_their_error_code() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _state) = spawn_app(dir.path()).await;
        let client = reqwest::Client::new();

        for url in [
            format!("{base}/api/versions/stable/1.1.110"),
            format!("{base}/api/mods/Krastorio2/1.3.24"),
        ] {
            let resp = client.post(&url).send().await.unwrap();
            assert_eq!(resp.status().as_u16(), 412, "{url}");
            let payload: error_payload::ErrorPayload = resp.json().await.unwrap();
            assert_eq!(payload.code, "missing_credentials");
        }

        let resp = client
            .post(format!("{base}/api/versions/stable/a%5Cb"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn versions_list_combines_upstream_and_installed() {
        let upstream = TestServer::spawn(Router::new().route(
            "/api/latest-releases",
            get(|| async {
                Json(serde_json::json!({
                    "stable": {"headless": "1.1.110"},
                    "experimental": {"headless": "2.0.8"}
                }))
            }),
        ))
        .await;
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app_with_upstream(dir.path(), &upstream.base).await;
        fs::create_dir_all(state.config.current().install_dir_for("stable", "1.1.110")).unwrap();

        let listing: serde_json::Value = reqwest::get(format!("{base}/api/versions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["available"]["experimental"]["headless"], "2.0.8");
        assert_eq!(listing["installed"]["stable"], serde_json::json!(["1.1.110"]));
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn versions_list_reports_unreachable_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _state) = spawn_app(dir.path()).await;
        let resp = reqwest::get(format!("{base}/api/versions")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 502);
    }
}
