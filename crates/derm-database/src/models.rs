//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use derm_core::{
    DermError, Diagnosis, Examination, ExaminationMeta, ImageRecord, Patient, PredictionResult,
    Sex,
};
use sqlx::FromRow;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub patient_id: String,
    pub given_name: String,
    pub family_name: String,
    pub middle_name: Option<String>,
    pub sex: String, // 存储为单字符，转换为Sex枚举
    pub age: i32,
}

impl TryFrom<DbPatient> for Patient {
    type Error = DermError;

    fn try_from(db_patient: DbPatient) -> Result<Self, Self::Error> {
        let sex = Sex::from_db_str(db_patient.sex.trim()).ok_or_else(|| {
            DermError::Database(format!(
                "patient {} has invalid sex value '{}'",
                db_patient.patient_id, db_patient.sex
            ))
        })?;

        Ok(Patient {
            patient_id: db_patient.patient_id,
            given_name: db_patient.given_name,
            family_name: db_patient.family_name,
            middle_name: db_patient.middle_name,
            sex,
            age: db_patient.age,
        })
    }
}

/// 数据库影像表
#[derive(Debug, FromRow)]
pub struct DbImage {
    pub id: i64,
    pub object_key: String,
}

impl From<DbImage> for ImageRecord {
    fn from(db_image: DbImage) -> Self {
        ImageRecord {
            id: db_image.id,
            object_key: db_image.object_key,
        }
    }
}

/// 检查表与患者、影像表的联合查询行
#[derive(Debug, FromRow)]
pub struct DbExaminationRow {
    pub id: i64,
    pub prediction_label: String,
    pub prediction_confidence: f64,
    pub location: Option<String>,
    pub examination_date: NaiveDate,
    pub doctor: String,
    pub patient_id: String,
    pub given_name: String,
    pub family_name: String,
    pub middle_name: Option<String>,
    pub sex: String,
    pub age: i32,
    pub image_id: i64,
    pub object_key: String,
}

impl DbExaminationRow {
    /// 组装完整检查记录
    pub fn into_examination(self, diagnoses: Vec<Diagnosis>) -> Result<Examination, DermError> {
        let patient = Patient::try_from(DbPatient {
            patient_id: self.patient_id,
            given_name: self.given_name,
            family_name: self.family_name,
            middle_name: self.middle_name,
            sex: self.sex,
            age: self.age,
        })?;

        Ok(Examination {
            id: self.id,
            prediction: PredictionResult {
                label: self.prediction_label,
                confidence: self.prediction_confidence,
            },
            location: self.location,
            date: self.examination_date,
            doctor: self.doctor,
            patient,
            image: ImageRecord {
                id: self.image_id,
                object_key: self.object_key,
            },
            diagnoses,
        })
    }
}

/// 数据库诊断表
#[derive(Debug, FromRow)]
pub struct DbDiagnosis {
    pub id: i64,
    pub examination_id: i64,
    pub result: String,
    pub doctor: String,
    pub created_at: DateTime<Utc>,
}

impl From<DbDiagnosis> for Diagnosis {
    fn from(db_diagnosis: DbDiagnosis) -> Self {
        Diagnosis {
            id: db_diagnosis.id,
            examination_id: db_diagnosis.examination_id,
            result: db_diagnosis.result,
            doctor: db_diagnosis.doctor,
            created_at: db_diagnosis.created_at,
        }
    }
}

// 插入模型 - 用于创建新记录

/// 新检查插入模型
#[derive(Debug, Clone)]
pub struct NewExamination {
    pub patient_id: String,
    pub image_id: i64,
    pub prediction: PredictionResult,
    pub meta: ExaminationMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_row_conversion() {
        let row = DbPatient {
            patient_id: "P-1".to_string(),
            given_name: "Ivan".to_string(),
            family_name: "Sidorov".to_string(),
            middle_name: Some("Petrovich".to_string()),
            sex: "M".to_string(),
            age: 63,
        };
        let patient = Patient::try_from(row).unwrap();
        assert_eq!(patient.sex, Sex::Male);

        let corrupt = DbPatient {
            patient_id: "P-2".to_string(),
            given_name: "A".to_string(),
            family_name: "B".to_string(),
            middle_name: None,
            sex: "?".to_string(),
            age: 1,
        };
        assert!(Patient::try_from(corrupt).is_err());
    }
}
