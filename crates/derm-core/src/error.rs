//! 错误定义模块

use thiserror::Error;

/// 系统统一错误类型
#[derive(Error, Debug)]
pub enum DermError {
    #[error("配置错误: {0}")]
    Config(String),

    /// 关系库失败：约束冲突、连接丢失或提交失败
    #[error("数据库错误: {0}")]
    Database(String),

    /// 对象存储不可达或拒绝写入
    #[error("存储错误: {0}")]
    Storage(String),

    /// 分类服务不可用。只在预测客户端和工作流之间流转，不会返回给调用方
    #[error("预测服务不可用: {0}")]
    PredictionUnavailable(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),
}

impl DermError {
    /// 该错误是否发生在对象存储一侧
    pub fn is_storage(&self) -> bool {
        matches!(self, DermError::Storage(_))
    }

    /// 该错误是否发生在关系库一侧
    pub fn is_database(&self) -> bool {
        matches!(self, DermError::Database(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for DermError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DermError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => DermError::Database(format!(
                "unique constraint violated ({}): {}",
                db.constraint().unwrap_or("unknown"),
                db.message()
            )),
            _ => DermError::Database(err.to_string()),
        }
    }
}

/// 系统统一结果类型
pub type Result<T> = std::result::Result<T, DermError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(DermError::Storage("bucket missing".into()).is_storage());
        assert!(DermError::Database("commit failed".into()).is_database());
        assert!(!DermError::NotFound("examination 7".into()).is_database());
    }
}
