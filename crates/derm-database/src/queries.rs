//! PostgreSQL 存储实现

use std::collections::HashMap;

use async_trait::async_trait;
use derm_core::{Diagnosis, Examination, ImageRecord, NewDiagnosis, NewPatient, Patient, Result};
use sqlx::{Postgres, Transaction};

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::{RecordStore, RecordTransaction};

const EXAMINATION_SELECT: &str = r#"
    SELECT e.id, e.prediction_label, e.prediction_confidence, e.location,
           e.examination_date, e.doctor,
           p.patient_id, p.given_name, p.family_name, p.middle_name, p.sex, p.age,
           i.id AS image_id, i.object_key
    FROM examinations e
    JOIN patients p ON p.patient_id = e.patient_id
    JOIN images i ON i.id = e.image_id
"#;

const PATIENT_SELECT: &str =
    "SELECT patient_id, given_name, family_name, middle_name, sex, age FROM patients WHERE patient_id = $1";

/// 基于PostgreSQL的关系存储
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: DatabasePool,
}

impl PgRecordStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn database_pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// 批量加载诊断，按检查ID分组，组内按创建顺序
    async fn load_diagnoses(&self, examination_ids: &[i64]) -> Result<HashMap<i64, Vec<Diagnosis>>> {
        let mut grouped: HashMap<i64, Vec<Diagnosis>> = HashMap::new();
        if examination_ids.is_empty() {
            return Ok(grouped);
        }

        let rows = sqlx::query_as::<_, DbDiagnosis>(
            "SELECT id, examination_id, result, doctor, created_at FROM diagnoses \
             WHERE examination_id = ANY($1) ORDER BY created_at, id",
        )
        .bind(examination_ids)
        .fetch_all(self.pool.pool())
        .await?;

        for row in rows {
            grouped
                .entry(row.examination_id)
                .or_default()
                .push(Diagnosis::from(row));
        }
        Ok(grouped)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>> {
        let tx = self.pool.pool().begin().await?;
        Ok(Box::new(PgRecordTransaction { tx }))
    }

    async fn get_examination(&self, examination_id: i64) -> Result<Option<Examination>> {
        let row = sqlx::query_as::<_, DbExaminationRow>(&format!("{} WHERE e.id = $1", EXAMINATION_SELECT))
            .bind(examination_id)
            .fetch_optional(self.pool.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut diagnoses = self.load_diagnoses(&[row.id]).await?;
        let own = diagnoses.remove(&row.id).unwrap_or_default();
        row.into_examination(own).map(Some)
    }

    async fn get_examinations_by_patient(&self, patient_id: &str) -> Result<Vec<Examination>> {
        let rows = sqlx::query_as::<_, DbExaminationRow>(&format!(
            "{} WHERE e.patient_id = $1 ORDER BY e.examination_date DESC, e.id DESC",
            EXAMINATION_SELECT
        ))
        .bind(patient_id)
        .fetch_all(self.pool.pool())
        .await?;

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let mut diagnoses = self.load_diagnoses(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let own = diagnoses.remove(&row.id).unwrap_or_default();
                row.into_examination(own)
            })
            .collect()
    }

    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>(PATIENT_SELECT)
            .bind(patient_id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.map(Patient::try_from).transpose()
    }

    async fn get_image(&self, image_id: i64) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, DbImage>("SELECT id, object_key FROM images WHERE id = $1")
            .bind(image_id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(row.map(ImageRecord::from))
    }

    async fn find_image_by_key(&self, object_key: &str) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, DbImage>("SELECT id, object_key FROM images WHERE object_key = $1")
            .bind(object_key)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(row.map(ImageRecord::from))
    }

    async fn delete_examination(&self, examination_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM examinations WHERE id = $1")
            .bind(examination_id)
            .execute(self.pool.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL 事务
///
/// 丢弃时 sqlx 自动回滚。
pub struct PgRecordTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RecordTransaction for PgRecordTransaction {
    async fn upsert_patient(&mut self, patient: &NewPatient) -> Result<Patient> {
        // 并发写同一自然键时，ON CONFLICT 会等待对方提交，之后读到的是已存在的行
        sqlx::query(r#"
            INSERT INTO patients (patient_id, given_name, family_name, middle_name, sex, age)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (patient_id) DO NOTHING
        "#)
        .bind(&patient.patient_id)
        .bind(&patient.given_name)
        .bind(&patient.family_name)
        .bind(&patient.middle_name)
        .bind(patient.sex.as_db_str())
        .bind(patient.age)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query_as::<_, DbPatient>(PATIENT_SELECT)
            .bind(&patient.patient_id)
            .fetch_one(&mut *self.tx)
            .await?;

        Patient::try_from(row)
    }

    async fn insert_image(&mut self, object_key: &str) -> Result<ImageRecord> {
        let row = sqlx::query_as::<_, DbImage>(
            "INSERT INTO images (object_key) VALUES ($1) RETURNING id, object_key",
        )
        .bind(object_key)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(ImageRecord::from(row))
    }

    async fn insert_examination(&mut self, examination: &NewExamination) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(r#"
            INSERT INTO examinations
                (prediction_label, prediction_confidence, location, examination_date, doctor, image_id, patient_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
        "#)
        .bind(&examination.prediction.label)
        .bind(examination.prediction.confidence)
        .bind(&examination.meta.location)
        .bind(examination.meta.date)
        .bind(&examination.meta.doctor)
        .bind(examination.image_id)
        .bind(&examination.patient_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_diagnosis(
        &mut self,
        examination_id: i64,
        diagnosis: &NewDiagnosis,
    ) -> Result<Diagnosis> {
        let row = sqlx::query_as::<_, DbDiagnosis>(r#"
            INSERT INTO diagnoses (examination_id, result, doctor)
            VALUES ($1, $2, $3)
            RETURNING id, examination_id, result, doctor, created_at
        "#)
        .bind(examination_id)
        .bind(&diagnosis.result)
        .bind(&diagnosis.doctor)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Diagnosis::from(row))
    }

    async fn examination_exists(&mut self, examination_id: i64) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT id FROM examinations WHERE id = $1 FOR SHARE")
            .bind(examination_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(found.is_some())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
