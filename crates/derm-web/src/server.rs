//! Web服务器

use std::net::SocketAddr;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use derm_core::Result;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::handlers::{
    add_diagnosis, analyze, create_examination, get_examination, get_image,
    get_patient_examinations, health, metrics, AppState,
};

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState, max_upload_bytes: usize) -> Self {
        Self {
            addr,
            app: create_app(state, max_upload_bytes),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app).await?;

        Ok(())
    }
}

/// 构建完整路由
pub fn create_app(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // API路由
        .nest("/api", api_routes())
        .with_state(state)
        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
}

/// API 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/analyze", post(analyze))
        .route("/examinations", post(create_examination))
        .route("/examinations/:id", get(get_examination))
        .route("/examinations/:id/diagnoses", post(add_diagnosis))
        .route("/patients/:id/examinations", get(get_patient_examinations))
        .route("/images/:id", get(get_image))
}
