// 入口：装配配置、存储、路由与后台清理任务。
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use foreman::api;
use foreman::config::Config;
use foreman::retention::spawn_retention_worker;
use foreman::shutdown::watch_signals;
use foreman::state::AppState;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// A client that dribbles its headers gets cut off here.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::load();
    let state = Arc::new(AppState::new(config.clone())?);

    let root = watch_signals();
    let retention = if config.event_retention_days > 0 {
        Some(spawn_retention_worker(
            state.store.clone(),
            config.event_retention_days,
            config.retention_interval_hours,
            root.clone(),
        ))
    } else {
        None
    };

    let app = api::build_router(state.clone());
    let app = mount_ui(app);
    let app = app
        .layer(from_fn_with_state(state.clone(), api::auth_guard))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(api::request_id_guard))
        .layer(from_fn(api::panic_guard))
        .with_state(state.clone());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("coordinator listening on {addr}");

    // axum::serve has no knob for bounding header reads, so the accept loop
    // drives hyper directly with the header timeout configured.
    let mut http = http1::Builder::new();
    http.timer(TokioTimer::new());
    http.header_read_timeout(READ_HEADER_TIMEOUT);
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = TowerToHyperService::new(app.clone());
                let conn = graceful.watch(http.serve_connection(io, service));
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        debug!("connection ended with error: {err}");
                    }
                });
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(GRACEFUL_SHUTDOWN_DEADLINE) => {
            warn!("graceful shutdown deadline exceeded, exiting");
        }
    }

    if let Some(handle) = retention {
        let _ = handle.await;
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Serves the bundled browser UI when present; the assets are an opaque
/// collaborator and live outside the API prefix.
fn mount_ui(app: Router<Arc<AppState>>) -> Router<Arc<AppState>> {
    let dir = PathBuf::from("web");
    if dir.exists() {
        let service = ServeDir::new(dir).append_index_html_on_directories(true);
        app.fallback_service(service)
    } else {
        app.fallback(api::fallback_not_found)
    }
}
