//! # 数据库模块
//!
//! 负责患者、影像引用、检查和诊断记录的持久化。对外提供事务化的存储接口，
//! 以及 PostgreSQL 与进程内两种实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::MemoryRecordStore;
pub use models::NewExamination;
pub use queries::PgRecordStore;
pub use store::{RecordStore, RecordTransaction};
