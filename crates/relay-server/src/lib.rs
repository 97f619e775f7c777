use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Form, Router};
use relay_config::Config;
use relay_kernel::{ERROR_CATEGORY, STARTUP_CATEGORY};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub mod activity;
pub mod cache;
pub mod matrix;
pub mod router;
pub mod tracker;

use activity::ActivityLog;
use cache::LookupCache;
use matrix::MatrixClient;
use router::StoryRouter;
use tracker::{load_aliases, AliasTable, Resolver, TrackerClient};

pub const BUILD_VERSION: &str = match option_env!("PHAB_RELAY_BUILD") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg).await?;
    let shutdown = state.shutdown.clone();
    let app = routes(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "ready...");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => info!("shutdown requested"),
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        })
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(routes(state))
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", post(story))
        .route("/alive", get(alive))
        .route("/shutdown", get(shutdown).post(shutdown))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    stories: Arc<StoryRouter>,
    matrix: Arc<MatrixClient>,
    activity: ActivityLog,
    shutdown: Arc<Notify>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        info!(version = BUILD_VERSION, "starting phab-relay receiving hook");
        debug!(config = %cfg.redacted(), "debugging enabled");

        let activity = ActivityLog::spawn(&cfg.activity.log_dir);
        let tracker = Arc::new(TrackerClient::new(&cfg.tracker)?);
        let aliases = match cfg.tracker.lookup_phid.as_deref() {
            Some(phid) => load_aliases(&tracker, phid, &activity).await,
            None => AliasTable::default(),
        };
        let resolver = Arc::new(Resolver::new(
            tracker,
            Arc::new(LookupCache::new()),
            Arc::new(aliases),
            activity.clone(),
        ));
        let stories = Arc::new(StoryRouter::new(
            cfg.tracker.resolve_types.clone(),
            cfg.matrix.default_room.clone(),
            resolver,
        ));
        let matrix = Arc::new(MatrixClient::new(&cfg.matrix)?);

        activity.record(STARTUP_CATEGORY, "started");
        Ok(Self {
            stories,
            matrix,
            activity,
            shutdown: Arc::new(Notify::new()),
        })
    }

    async fn process_story(&self, fields: Vec<(String, String)>) {
        for (key, value) in &fields {
            debug!(%key, %value, "feed field");
        }

        let routed = match self.stories.route(&fields).await {
            Ok(Some(routed)) => routed,
            Ok(None) => {
                debug!("not a story, discarded");
                return;
            }
            Err(e) => {
                warn!(error = %e, "unable to parse tagged story");
                self.activity
                    .record(ERROR_CATEGORY, format!("tagged story: {e}"));
                return;
            }
        };

        debug!(room = %routed.room, text = %routed.text, "emitting story");
        if let Err(e) = self
            .matrix
            .emit(&routed.text, &routed.room, &routed.references)
            .await
        {
            error!(error = %e, "unable to post story");
            self.activity.record(ERROR_CATEGORY, e);
        }
    }
}

async fn story(
    State(state): State<AppState>,
    Form(fields): Form<Vec<(String, String)>>,
) -> StatusCode {
    state.process_story(fields).await;
    StatusCode::OK
}

async fn alive() -> String {
    format!("version: {BUILD_VERSION}")
}

async fn shutdown(State(state): State<AppState>) -> StatusCode {
    info!("shutdown endpoint called");
    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, state.activity.flush())
        .await
        .is_err()
    {
        warn!("activity log not drained before shutdown");
    }
    state.shutdown.notify_one();
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alive_reports_build_version() {
        assert_eq!(alive().await, format!("version: {BUILD_VERSION}"));
        assert!(!BUILD_VERSION.is_empty());
    }
}
