//! HTTP frontend (cargo feature `api`).
//!
//! Thin collaborator over the core: handlers translate query parameters
//! into [`Store`] calls and core errors into status codes. Writes landing
//! on a non-leader are redirected with an HTTP 307 and a `Location`
//! pointing at the leader, built from a URL template like
//! `http://kv-{id}:8001`.
//!
//! | Route | Behavior |
//! |-------|----------|
//! | `GET /get?key=k` | 200 with the value, 404 `Key not found` when absent or tombstoned |
//! | `PUT /put?key=k&val=v` | 200 `Success`; 307 to the leader; 404 no leader; 503 mid-transition; 500 on core errors |
//! | `DELETE /delete?key=k` | 204; 400 without a key; same redirect rules |
//! | `GET /metrics` | Prometheus text exposition |

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, web};
use tracing::info;

use crate::metrics::Metrics;
use crate::store::{Store, StoreError};

/// Everything the handlers need, cloned into each worker.
#[derive(Clone)]
pub struct ApiContext {
    /// The local store node.
    pub store: Arc<Store>,
    /// Template for peer HTTP URLs; `{id}` is replaced by the leader id.
    pub peer_url_template: String,
}

impl ApiContext {
    fn leader_url(&self, leader: u64) -> String {
        self.peer_url_template.replace("{id}", &leader.to_string())
    }

    /// Redirect decision tree for a write that landed on a non-leader.
    fn redirect(&self, path_and_query: &str) -> HttpResponse {
        match self.store.leader() {
            None => HttpResponse::NotFound().body("Leader not found"),
            Some(leader) if leader == self.store.node_id() => {
                HttpResponse::ServiceUnavailable().body("Cluster in leadership transition")
            }
            Some(leader) => HttpResponse::TemporaryRedirect()
                .insert_header((
                    "Location",
                    format!("{}{}", self.leader_url(leader), path_and_query),
                ))
                .finish(),
        }
    }
}

type Query = web::Query<HashMap<String, String>>;

async fn handle_get(ctx: web::Data<ApiContext>, query: Query) -> HttpResponse {
    Metrics::inc(&ctx.store.metrics().http_get);
    // An absent key reads as the empty key and falls out as a plain miss.
    let key = query.get("key").cloned().unwrap_or_default();

    let store = Arc::clone(&ctx.store);
    match web::block(move || store.get(&key)).await {
        Ok(Ok(Some(value))) => HttpResponse::Ok().body(value),
        Ok(Ok(None)) => HttpResponse::NotFound().body("Key not found"),
        Ok(Err(e)) => HttpResponse::InternalServerError().body(e.to_string()),
        Err(_) => HttpResponse::InternalServerError().body("worker unavailable"),
    }
}

async fn handle_put(ctx: web::Data<ApiContext>, query: Query) -> HttpResponse {
    Metrics::inc(&ctx.store.metrics().http_put);
    let key = query.get("key").cloned().unwrap_or_default();
    let val = query.get("val").cloned().unwrap_or_default();

    let store = Arc::clone(&ctx.store);
    let redirect_target = format!("/put?key={key}&val={val}");
    match web::block(move || store.put(&key, &val)).await {
        Ok(Ok(())) => HttpResponse::Ok().body("Success"),
        Ok(Err(StoreError::NotLeader)) => ctx.redirect(&redirect_target),
        Ok(Err(e)) => HttpResponse::InternalServerError().body(e.to_string()),
        Err(_) => HttpResponse::InternalServerError().body("worker unavailable"),
    }
}

async fn handle_delete(ctx: web::Data<ApiContext>, query: Query) -> HttpResponse {
    Metrics::inc(&ctx.store.metrics().http_delete);
    let Some(key) = query.get("key").cloned() else {
        return HttpResponse::BadRequest().body("key is required");
    };

    let store = Arc::clone(&ctx.store);
    let redirect_target = format!("/delete?key={key}");
    match web::block(move || store.delete(&key)).await {
        Ok(Ok(())) => HttpResponse::NoContent().finish(),
        Ok(Err(StoreError::NotLeader)) => ctx.redirect(&redirect_target),
        Ok(Err(e)) => HttpResponse::InternalServerError().body(e.to_string()),
        Err(_) => HttpResponse::InternalServerError().body("worker unavailable"),
    }
}

async fn handle_metrics(ctx: web::Data<ApiContext>) -> HttpResponse {
    match ctx.store.metrics_text() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(text),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

/// Runs the HTTP frontend until the server is stopped.
pub async fn serve_http(ctx: ApiContext, http_port: u16) -> std::io::Result<()> {
    info!(http_port, "HTTP frontend listening");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ctx.clone()))
            .route("/get", web::get().to(handle_get))
            .route("/put", web::put().to(handle_put))
            .route("/delete", web::delete().to(handle_delete))
            .route("/metrics", web::get().to(handle_metrics))
    })
    .bind(("0.0.0.0", http_port))?
    .run()
    .await
}
