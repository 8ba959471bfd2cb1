use crate::cli::Args;
use crate::models::transcript::TranscriptQuery;
use crate::store::TranscriptStore;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::get,
    Router,
    Json,
    extract::{ State, Query },
    response::{ IntoResponse, Response },
    http::StatusCode,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error };

/// Listings larger than this are truncated even when the caller asks for more.
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn TranscriptStore>,
}

pub fn router(store: Arc<dyn TranscriptStore>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/transcripts", get(list_transcripts_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/health", get(health_handler))
        .layer(cors)
        .with_state(AppState { store })
}

pub async fn start_http_server(
    http_port: u16,
    store: Arc<dyn TranscriptStore>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(store);

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            tokio::spawn(async move {
                let result = axum_server
                    ::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service()).await;

                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });

            info!("HTTPS server started with TLS enabled");
        }
        _ => {
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                            error!("HTTP server error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                    }
                }
            });

            info!("HTTP server started");
        }
    }

    Ok(())
}

fn store_failure(e: impl std::fmt::Display) -> Response {
    error!("Transcript store query failed: {}", e);
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody {
            success: false,
            message: format!("Transcript store unavailable: {}", e),
        }),
    ).into_response()
}

async fn list_transcripts_handler(
    State(state): State<AppState>,
    Query(mut query): Query<TranscriptQuery>
) -> Response {
    query.limit = Some(query.limit.unwrap_or(MAX_LIST_LIMIT).min(MAX_LIST_LIMIT));
    match state.store.list(&query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_failure(e),
    }
}

async fn list_sessions_handler(State(state): State<AppState>) -> Response {
    match state.store.sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => store_failure(e),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}
