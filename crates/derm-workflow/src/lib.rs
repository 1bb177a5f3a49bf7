//! # Derm 工作流模块
//!
//! 标签规范化和跨对象存储、关系库的入库流程。

pub mod canonicalizer;
pub mod engine;

#[cfg(test)]
mod test_support;

pub use canonicalizer::{CanonicalOutcome, Canonicalized, Canonicalizer};
pub use engine::{
    ImageUpload, IngestionEngine, IngestionReceipt, IngestionRequest, PredictionSource,
};
