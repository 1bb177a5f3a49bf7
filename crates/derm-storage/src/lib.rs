//! # Derm 存储模块
//!
//! 负责影像对象的写入、存在性检查和限时访问链接。

pub mod storage;

pub use storage::*;
