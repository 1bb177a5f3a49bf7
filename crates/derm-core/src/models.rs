//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DermError, Result};
use crate::taxonomy::DiagnosticCode;

/// 置信度保留的小数位数
pub const CONFIDENCE_DECIMALS: i32 = 6;

const MAX_PATIENT_ID_LEN: usize = 50;
const MAX_NAME_LEN: usize = 40;
const MAX_DOCTOR_LEN: usize = 50;
const MAX_RESULT_LEN: usize = 50;
const MAX_LOCATION_LEN: usize = 2;
const MAX_AGE: i32 = 150;

/// 性别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "M" => Some(Sex::Male),
            "F" => Some(Sex::Female),
            _ => None,
        }
    }
}

/// 患者信息，以身份证号等自然键标识
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: String,           // 自然键
    pub given_name: String,           // 名
    pub family_name: String,          // 姓
    pub middle_name: Option<String>,  // 中间名/父称
    pub sex: Sex,
    pub age: i32,
}

/// 新患者数据，按自然键写入，已存在时沿用旧记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPatient {
    pub patient_id: String,
    pub given_name: String,
    pub family_name: String,
    pub middle_name: Option<String>,
    pub sex: Sex,
    pub age: i32,
}

impl NewPatient {
    pub fn validate(&self) -> Result<()> {
        require_text("patient_id", &self.patient_id, MAX_PATIENT_ID_LEN)?;
        require_text("given_name", &self.given_name, MAX_NAME_LEN)?;
        require_text("family_name", &self.family_name, MAX_NAME_LEN)?;
        if let Some(middle) = &self.middle_name {
            limit_text("middle_name", middle, MAX_NAME_LEN)?;
        }
        if !(0..=MAX_AGE).contains(&self.age) {
            return Err(DermError::Validation(format!("age out of range: {}", self.age)));
        }
        Ok(())
    }

    pub fn into_patient(self) -> Patient {
        Patient {
            patient_id: self.patient_id,
            given_name: self.given_name,
            family_name: self.family_name,
            middle_name: self.middle_name,
            sex: self.sex,
            age: self.age,
        }
    }
}

/// 对象存储中影像的关系库引用，只保存对象键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub object_key: String,
}

/// 模型预测结果
///
/// `label` 总是 `<显示名称> (<代码>)`，`confidence` 位于 [0, 1] 并保留 6 位小数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub label: String,
    pub confidence: f64,
}

impl PredictionResult {
    pub fn new(code: DiagnosticCode, confidence: f64) -> Self {
        Self {
            label: code.label(),
            confidence: round_confidence(confidence.clamp(0.0, 1.0)),
        }
    }

    /// 解析标签中的诊断代码
    pub fn code(&self) -> Option<DiagnosticCode> {
        DiagnosticCode::from_label(&self.label)
    }

    /// 校验调用方直接提供的预测结果
    pub fn validate(&self) -> Result<()> {
        if self.code().is_none() {
            return Err(DermError::Validation(format!(
                "prediction label is not a canonical label: {}",
                self.label
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(DermError::Validation(format!(
                "prediction confidence out of range: {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// 预测来源模式：调用外部分类服务，或直接使用模拟结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionMode {
    #[default]
    Remote,
    Simulated,
}

/// 将置信度四舍五入到固定小数位
pub fn round_confidence(value: f64) -> f64 {
    let factor = 10f64.powi(CONFIDENCE_DECIMALS);
    (value * factor).round() / factor
}

/// 检查元数据（不含模型结果）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExaminationMeta {
    pub location: Option<String>, // 部位代码，两位
    pub date: NaiveDate,
    pub doctor: String, // 检查医生
}

impl ExaminationMeta {
    pub fn validate(&self) -> Result<()> {
        require_text("doctor", &self.doctor, MAX_DOCTOR_LEN)?;
        if let Some(location) = &self.location {
            limit_text("location", location, MAX_LOCATION_LEN)?;
        }
        Ok(())
    }
}

/// 检查记录，连同患者、影像和诊断列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Examination {
    pub id: i64,
    pub prediction: PredictionResult,
    pub location: Option<String>,
    pub date: NaiveDate,
    pub doctor: String,
    pub patient: Patient,
    pub image: ImageRecord,
    pub diagnoses: Vec<Diagnosis>,
}

/// 诊断记录，只追加
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: i64,
    pub examination_id: i64,
    pub result: String,
    pub doctor: String,
    pub created_at: DateTime<Utc>,
}

/// 新诊断数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDiagnosis {
    pub result: String,
    pub doctor: String,
}

impl NewDiagnosis {
    pub fn validate(&self) -> Result<()> {
        require_text("result", &self.result, MAX_RESULT_LEN)?;
        require_text("doctor", &self.doctor, MAX_DOCTOR_LEN)
    }
}

fn require_text(field: &str, value: &str, max: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DermError::Validation(format!("{} must not be empty", field)));
    }
    limit_text(field, value, max)
}

fn limit_text(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(DermError::Validation(format!(
            "{} exceeds {} characters",
            field, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patient() -> NewPatient {
        NewPatient {
            patient_id: "112-233-445 95".to_string(),
            given_name: "Anna".to_string(),
            family_name: "Petrova".to_string(),
            middle_name: None,
            sex: Sex::Female,
            age: 41,
        }
    }

    #[test]
    fn test_patient_validation() {
        assert!(patient().validate().is_ok());

        let mut bad = patient();
        bad.patient_id = "  ".to_string();
        assert!(matches!(bad.validate(), Err(DermError::Validation(_))));

        let mut bad = patient();
        bad.age = 200;
        assert!(bad.validate().is_err());

        let mut bad = patient();
        bad.middle_name = Some("x".repeat(41));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_examination_location_limit() {
        let meta = ExaminationMeta {
            location: Some("CHE".to_string()),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            doctor: "Dr. Orlov".to_string(),
        };
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_prediction_result_rounding() {
        let result = PredictionResult::new(DiagnosticCode::Mel, 0.123456789);
        assert_eq!(result.label, "Melanoma (MEL)");
        assert_eq!(result.confidence, 0.123457);
        assert_eq!(result.code(), Some(DiagnosticCode::Mel));

        let clamped = PredictionResult::new(DiagnosticCode::Df, 1.7);
        assert_eq!(clamped.confidence, 1.0);
    }

    #[test]
    fn test_supplied_prediction_validation() {
        let ok = PredictionResult {
            label: "Dermatofibroma (DF)".to_string(),
            confidence: 0.5,
        };
        assert!(ok.validate().is_ok());

        let bad_label = PredictionResult {
            label: "Something (XX)".to_string(),
            confidence: 0.5,
        };
        assert!(bad_label.validate().is_err());

        let bad_confidence = PredictionResult {
            label: "Dermatofibroma (DF)".to_string(),
            confidence: f64::NAN,
        };
        assert!(bad_confidence.validate().is_err());
    }

    #[test]
    fn test_sex_db_mapping() {
        assert_eq!(Sex::from_db_str(Sex::Male.as_db_str()), Some(Sex::Male));
        assert_eq!(Sex::from_db_str("O"), None);
    }
}
