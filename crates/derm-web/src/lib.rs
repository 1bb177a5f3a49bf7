//! 皮肤影像 HTTP 接口

pub mod handlers;
pub mod server;

pub use handlers::{AnalysisResponse, ApiError, AppState, DiagnosisBody};
pub use server::{create_app, WebServer};
