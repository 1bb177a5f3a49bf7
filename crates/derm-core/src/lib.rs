//! # Derm Core
//!
//! 皮肤影像检查记录系统的核心模块，提供诊断分类、基础数据结构、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod taxonomy;
pub mod utils;

pub use error::{DermError, Result};
pub use models::*;
pub use taxonomy::DiagnosticCode;
