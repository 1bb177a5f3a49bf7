//! # Derm 管理模块
//!
//! 配置加载与验证、日志初始化和入库流程指标。

pub mod config;
pub mod logging;
pub mod monitoring;

pub use config::{
    ConfigValidator, DatabaseBackend, DermConfig, LogFormat, StorageBackend,
};
pub use logging::init_tracing;
pub use monitoring::IngestionMonitor;
