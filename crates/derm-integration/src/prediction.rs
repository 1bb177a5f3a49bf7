//! 外部分类服务客户端
//!
//! 把影像以 multipart 上传给分类服务，取回未经规范化的原始预测。
//! 所有失败都归入 [`PredictionError`]，由入库流程吸收并走兜底分支。

use std::time::Duration;

use async_trait::async_trait;
use derm_core::DermError;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// 按优先级尝试的标签字段
const LABEL_KEYS: [&str; 3] = ["label", "predicted_label", "examination_result_model"];
/// 按优先级尝试的置信度字段
const CONFIDENCE_KEYS: [&str; 2] = ["confidence", "model_confidence"];

const BODY_PREVIEW_LEN: usize = 1000;

/// 预测失败
#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Classifier unreachable: {0}")]
    Unreachable(String),

    #[error("Classifier timed out: {0}")]
    Timeout(String),

    #[error("Classifier returned a bad response: {0}")]
    BadResponse(String),
}

impl From<PredictionError> for DermError {
    fn from(err: PredictionError) -> Self {
        DermError::PredictionUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for PredictionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PredictionError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            PredictionError::Unreachable(err.to_string())
        } else {
            PredictionError::BadResponse(err.to_string())
        }
    }
}

/// 分类服务返回的原始预测，尚未映射到诊断代码
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPrediction {
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub probabilities: Option<Vec<f64>>,
}

impl RawPrediction {
    /// 从响应体中提取字段；响应体必须是 JSON 对象
    pub fn from_json(body: &Value) -> Result<Self, PredictionError> {
        let object = body
            .as_object()
            .ok_or_else(|| PredictionError::BadResponse("response body is not a JSON object".to_string()))?;

        let label = LABEL_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(value_as_text))
            .or_else(|| object.get("index").and_then(value_as_text));

        let confidence = CONFIDENCE_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(value_as_f64));

        Ok(Self {
            label,
            confidence,
            probabilities: probabilities(object),
        })
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn probabilities(object: &Map<String, Value>) -> Option<Vec<f64>> {
    let values: Vec<f64> = object
        .get("probabilities")?
        .as_array()?
        .iter()
        .filter_map(value_as_f64)
        .collect();
    (!values.is_empty()).then_some(values)
}

/// 分类器接口
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn predict(&self, image: &[u8]) -> Result<RawPrediction, PredictionError>;
}

/// 分类服务连接配置
#[derive(Debug, Clone)]
pub struct PredictionClientConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for PredictionClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/predict".to_string(),
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(15),
        }
    }
}

/// 基于 HTTP 的分类服务客户端
#[derive(Debug, Clone)]
pub struct PredictionClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PredictionClient {
    pub fn new(config: PredictionClientConfig) -> Result<Self, DermError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            // 两次读取之间的最长间隔，不是整个请求的期限
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| DermError::Config(format!("failed to build classifier client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Classifier for PredictionClient {
    async fn predict(&self, image: &[u8]) -> Result<RawPrediction, PredictionError> {
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name("image.jpg")
            .mime_str("application/octet-stream")
            .map_err(|e| PredictionError::BadResponse(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("image_file", part);

        info!(endpoint = %self.endpoint, size = image.len(), "Sending image to classifier");
        let response = self.client.post(&self.endpoint).multipart(form).send().await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(%status, body = %preview(&body), "Classifier responded");

        if !status.is_success() {
            warn!(%status, "Classifier returned an error status");
            return Err(PredictionError::BadResponse(format!("status {}", status)));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| PredictionError::BadResponse(format!("invalid JSON: {}", e)))?;
        RawPrediction::from_json(&json)
    }
}

fn preview(body: &str) -> String {
    if body.len() <= BODY_PREVIEW_LEN {
        return body.to_string();
    }
    let mut end = BODY_PREVIEW_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
