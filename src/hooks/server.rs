//! HTTP hook listener.
//!
//! One handler serves every hook path: the body is read raw so malformed
//! JSON can be answered with the protocol's 400/code-2 reply instead of the
//! framework default, and the action falls back to the URL path when the
//! body omits it. A handler produces exactly one response per request, which
//! is what guarantees no double-reply even when the scheduler side completes
//! asynchronously.

use crate::cache::CacheClient;
use crate::config::ServerConfig;
use crate::error::{GatewayError, HookResult};
use crate::hooks::controller::HookController;
use crate::metrics::{observe_hook_request, serve_metrics};
use crate::models::{HookAction, HookRequest, HookResponse};
use crate::repository::StreamStateStore;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const SERVER_HEADER: (&str, &str) = ("Server", "StreamGate/1.0");

/// Live backend handles for the health endpoint.
pub struct HealthProbes {
    pub cache: CacheClient,
    pub db: PgPool,
    pub state: Arc<dyn StreamStateStore>,
}

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<HookController>,
    pub probes: Option<Arc<HealthProbes>>,
}

fn action_for_path(path: &str) -> Option<HookAction> {
    match path {
        "/index/hook/on_publish" => Some(HookAction::Publish),
        "/index/hook/on_play" => Some(HookAction::Play),
        "/index/hook/on_publish_done" => Some(HookAction::PublishDone),
        "/index/hook/on_play_done" => Some(HookAction::PlayDone),
        "/index/hook/on_stream_none_reader" => Some(HookAction::StreamNoneReader),
        "/index/hook/on_stream_not_found" => Some(HookAction::StreamNotFound),
        _ => None,
    }
}

fn hook_reply(resp: &HookResponse) -> HttpResponse {
    HttpResponse::build(resp.result.http_status())
        .insert_header(SERVER_HEADER)
        .json(resp)
}

fn invalid_format(action: HookAction, started: Instant) -> HttpResponse {
    let resp = HookResponse::new(HookResult::InvalidFormat, "Invalid hook format");
    observe_hook_request(action.as_str(), resp.code, started.elapsed());
    hook_reply(&resp)
}

async fn handle_hook(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    let started = Instant::now();

    // Only POST carries hooks; everything else is a session-level reject.
    if req.method() != actix_web::http::Method::POST {
        return HttpResponse::MethodNotAllowed()
            .insert_header(SERVER_HEADER)
            .json(json!({"code": 999, "msg": "Method not allowed"}));
    }

    let Some(path_action) = action_for_path(req.path()) else {
        return HttpResponse::NotFound()
            .insert_header(SERVER_HEADER)
            .json(json!({"code": 999, "msg": "Not found"}));
    };

    let Ok(value) = serde_json::from_slice::<Value>(&body) else {
        warn!(path = req.path(), "hook body is not valid JSON");
        return invalid_format(path_action, started);
    };

    let Some(mut hook) = HookRequest::from_value(&value) else {
        warn!(path = req.path(), "hook body is not a JSON object");
        return invalid_format(path_action, started);
    };

    // The body's action wins; the URL path fills in when it is absent.
    if hook.action == HookAction::Unknown {
        hook.action = path_action;
    }

    let resp = state.controller.route(&hook).await;
    observe_hook_request(hook.action.as_str(), resp.code, started.elapsed());
    hook_reply(&resp)
}

/// Paths outside the hook namespace. Code 999 marks session-level
/// rejections that never reached the controller.
async fn fallback() -> HttpResponse {
    HttpResponse::NotFound()
        .insert_header(SERVER_HEADER)
        .json(json!({"code": 999, "msg": "Not found"}))
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let Some(probes) = &state.probes else {
        return HttpResponse::Ok().json(json!({"status": "ok"}));
    };

    let redis_ok = probes.cache.ping().await;
    let db_ok = sqlx::query("SELECT 1").execute(&probes.db).await.is_ok();

    let body = json!({
        "status": if redis_ok && db_ok { "ok" } else { "degraded" },
        "redis": redis_ok,
        "database": db_ok,
        "active_publishers": probes.state.active_publisher_count().await,
        "active_players": probes.state.active_player_count().await,
    });
    if redis_ok && db_ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    // One catch-all resource for the hook namespace; handle_hook performs
    // the method and action checks itself so rejects carry the protocol's
    // JSON body instead of a framework default.
    cfg.service(
        web::scope("/index/hook")
            .service(web::resource("/{action}").route(web::route().to(handle_hook))),
    )
    .route("/health", web::get().to(health))
    .route("/metrics", web::get().to(serve_metrics))
    .default_service(web::route().to(fallback));
}

pub struct HookServer {
    settings: ServerConfig,
    state: AppState,
}

impl HookServer {
    pub fn new(settings: ServerConfig, state: AppState) -> HookServer {
        HookServer { settings, state }
    }

    /// Bind, listen and serve until shutdown. Actix stops accepting first
    /// and lets in-flight requests finish before the workers join.
    pub async fn run(self) -> Result<(), GatewayError> {
        let bind_addr = format!("{}:{}", self.settings.address, self.settings.port);
        let state = self.state;
        let workers = self.settings.io_threads.max(1);

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_routes)
        })
        .workers(workers)
        .bind(&bind_addr)
        .map_err(|source| GatewayError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        info!(%bind_addr, workers, "hook server listening");
        server.run().await.map_err(GatewayError::Server)
    }
}
