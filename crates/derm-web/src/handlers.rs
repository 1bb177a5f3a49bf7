//! HTTP处理器

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
};
use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use derm_core::{
    DermError, ExaminationMeta, NewDiagnosis, NewPatient, PredictionResult, Sex,
};
use derm_workflow::{ImageUpload, IngestionEngine, IngestionRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IngestionEngine>,
}

impl AppState {
    pub fn new(engine: Arc<IngestionEngine>) -> Self {
        Self { engine }
    }
}

/// HTTP 层错误，包装领域错误并映射状态码
#[derive(Debug)]
pub struct ApiError(pub DermError);

impl From<DermError> for ApiError {
    fn from(err: DermError) -> Self {
        ApiError(err)
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        ApiError(DermError::Validation(format!("malformed multipart body: {}", err)))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            DermError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            DermError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            DermError::Storage(_) => (StatusCode::BAD_GATEWAY, "storage"),
            DermError::PredictionUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "prediction"),
            DermError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus 指标
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state
        .engine
        .monitor()
        .render()
        .map_err(|e| DermError::Internal(e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// 分析结果
#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub label: String,
    pub confidence: f64,
    pub fallback: bool,
}

/// 只做预测，不写入任何存储
pub async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<AnalysisResponse>> {
    let mut image: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            image = Some(field.bytes().await?);
        }
    }

    let image = image
        .filter(|data| !data.is_empty())
        .ok_or_else(|| DermError::Validation("missing image".to_string()))?;

    let canonical = state.engine.predict(&image).await;
    Ok(Json(AnalysisResponse {
        fallback: canonical.is_fallback(),
        label: canonical.result.label,
        confidence: canonical.result.confidence,
    }))
}

/// 新建检查：multipart 表单字段加影像文件
pub async fn create_examination(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let form = ExaminationForm::read(multipart).await?;
    let request = form.into_request()?;
    let patient_id = request.patient.patient_id.clone();

    let receipt = state.engine.ingest(request).await?;
    info!(
        patient_id = %patient_id,
        examination_id = receipt.examination.id,
        "Examination created via API"
    );

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// 按ID读取检查
pub async fn get_examination(
    State(state): State<AppState>,
    Path(examination_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let examination = state.engine.get_examination(examination_id).await?;
    Ok(Json(examination))
}

/// 患者的全部检查
pub async fn get_patient_examinations(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let examinations = state.engine.examinations_for_patient(&patient_id).await?;
    Ok(Json(examinations))
}

/// 追加诊断请求体
#[derive(Debug, Deserialize)]
pub struct DiagnosisBody {
    pub result: String,
    pub doctor: String,
}

/// 为检查追加诊断
pub async fn add_diagnosis(
    State(state): State<AppState>,
    Path(examination_id): Path<i64>,
    Json(body): Json<DiagnosisBody>,
) -> ApiResult<impl IntoResponse> {
    let diagnosis = state
        .engine
        .append_diagnosis(
            examination_id,
            NewDiagnosis {
                result: body.result,
                doctor: body.doctor,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(diagnosis)))
}

/// 重定向到影像的限时链接
pub async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<i64>,
) -> ApiResult<Redirect> {
    let url = state.engine.image_url(image_id).await?;
    Ok(Redirect::temporary(&url))
}

/// 新建检查的表单内容
#[derive(Debug, Default)]
struct ExaminationForm {
    fields: HashMap<String, String>,
    image: Option<(String, Bytes, String)>,
}

impl ExaminationForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = ExaminationForm::default();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "image" {
                let filename = field.file_name().unwrap_or("image").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                let data = field.bytes().await?;
                form.image = Some((filename, data, content_type));
            } else if !name.is_empty() {
                let value = field.text().await?;
                form.fields.insert(name, value);
            }
        }

        Ok(form)
    }

    fn required(&self, name: &str) -> Result<String, DermError> {
        self.optional(name)
            .ok_or_else(|| DermError::Validation(format!("missing field: {}", name)))
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn into_request(self) -> Result<IngestionRequest, DermError> {
        let age = self
            .required("age")?
            .parse::<i32>()
            .map_err(|_| DermError::Validation("age must be an integer".to_string()))?;

        let patient = NewPatient {
            patient_id: self.required("patient_id")?,
            given_name: self.required("given_name")?,
            family_name: self.required("family_name")?,
            middle_name: self.optional("middle_name"),
            sex: parse_sex(&self.required("sex")?)?,
            age,
        };

        let date = match self.optional("date") {
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|_| DermError::Validation(format!("invalid date: {}", raw)))?,
            None => Utc::now().date_naive(),
        };
        let doctor = self.required("doctor")?;

        let diagnosis = NewDiagnosis {
            result: self.required("diagnosis_result")?,
            doctor: self.optional("diagnosis_doctor").unwrap_or_else(|| doctor.clone()),
        };

        let examination = ExaminationMeta {
            location: self.optional("location"),
            date,
            doctor,
        };

        let prediction = match (self.optional("prediction_label"), self.optional("prediction_confidence")) {
            (Some(label), Some(confidence)) => Some(PredictionResult {
                label,
                confidence: confidence.parse().map_err(|_| {
                    DermError::Validation("prediction_confidence must be a number".to_string())
                })?,
            }),
            (None, None) => None,
            _ => {
                warn!("Incomplete supplied prediction rejected");
                return Err(DermError::Validation(
                    "prediction_label and prediction_confidence must be sent together".to_string(),
                ));
            }
        };

        let (filename, data, content_type) = self
            .image
            .ok_or_else(|| DermError::Validation("missing image".to_string()))?;

        Ok(IngestionRequest {
            patient,
            examination,
            diagnosis,
            image: ImageUpload::new(&filename, data, content_type),
            prediction,
        })
    }
}

fn parse_sex(raw: &str) -> Result<Sex, DermError> {
    match raw.to_ascii_lowercase().as_str() {
        "m" | "male" | "true" => Ok(Sex::Male),
        "f" | "female" | "false" => Ok(Sex::Female),
        _ => Err(DermError::Validation(format!("invalid sex: {}", raw))),
    }
}
