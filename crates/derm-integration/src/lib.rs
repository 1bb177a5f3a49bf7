//! # Derm 集成模块
//!
//! 与外部分类服务的对接：HTTP 客户端、原始预测解析和可替换的分类器接口。

pub mod prediction;

pub use prediction::{
    Classifier, PredictionClient, PredictionClientConfig, PredictionError, RawPrediction,
};
