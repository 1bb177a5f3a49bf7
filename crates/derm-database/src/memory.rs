//! 进程内存储实现
//!
//! 用于本地运行和测试。写入先暂存在事务中，提交时一次性校验约束并应用；
//! ID 在暂存时分配，回滚后不复用，与数据库序列一致。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use derm_core::{
    DermError, Diagnosis, Examination, ImageRecord, NewDiagnosis, NewPatient, Patient,
    PredictionResult, Result,
};
use tokio::sync::RwLock;

use crate::models::NewExamination;
use crate::store::{RecordStore, RecordTransaction};

#[derive(Debug, Clone)]
struct ExaminationRow {
    id: i64,
    patient_id: String,
    image_id: i64,
    prediction: PredictionResult,
    location: Option<String>,
    date: NaiveDate,
    doctor: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    patients: BTreeMap<String, Patient>,
    images: BTreeMap<i64, ImageRecord>,
    examinations: BTreeMap<i64, ExaminationRow>,
    diagnoses: BTreeMap<i64, Diagnosis>,
    last_image_id: i64,
    last_examination_id: i64,
    last_diagnosis_id: i64,
}

impl MemoryState {
    fn image_key_taken(&self, object_key: &str) -> bool {
        self.images.values().any(|image| image.object_key == object_key)
    }

    fn image_in_use(&self, image_id: i64) -> bool {
        self.examinations.values().any(|exam| exam.image_id == image_id)
    }

    fn assemble(&self, row: &ExaminationRow) -> Result<Examination> {
        let patient = self.patients.get(&row.patient_id).cloned().ok_or_else(|| {
            DermError::Database(format!("examination {} references missing patient", row.id))
        })?;
        let image = self.images.get(&row.image_id).cloned().ok_or_else(|| {
            DermError::Database(format!("examination {} references missing image", row.id))
        })?;
        let diagnoses = self
            .diagnoses
            .values()
            .filter(|diagnosis| diagnosis.examination_id == row.id)
            .cloned()
            .collect();

        Ok(Examination {
            id: row.id,
            prediction: row.prediction.clone(),
            location: row.location.clone(),
            date: row.date,
            doctor: row.doctor.clone(),
            patient,
            image,
            diagnoses,
        })
    }
}

/// 进程内关系存储
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已提交的患者数量
    pub async fn patient_count(&self) -> usize {
        self.state.read().await.patients.len()
    }

    /// 已提交的诊断数量
    pub async fn diagnosis_count(&self) -> usize {
        self.state.read().await.diagnoses.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            staged: Staged::default(),
        }))
    }

    async fn get_examination(&self, examination_id: i64) -> Result<Option<Examination>> {
        let state = self.state.read().await;
        state
            .examinations
            .get(&examination_id)
            .map(|row| state.assemble(row))
            .transpose()
    }

    async fn get_examinations_by_patient(&self, patient_id: &str) -> Result<Vec<Examination>> {
        let state = self.state.read().await;
        let mut rows: Vec<&ExaminationRow> = state
            .examinations
            .values()
            .filter(|row| row.patient_id == patient_id)
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));

        rows.into_iter().map(|row| state.assemble(row)).collect()
    }

    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        Ok(self.state.read().await.patients.get(patient_id).cloned())
    }

    async fn get_image(&self, image_id: i64) -> Result<Option<ImageRecord>> {
        Ok(self.state.read().await.images.get(&image_id).cloned())
    }

    async fn find_image_by_key(&self, object_key: &str) -> Result<Option<ImageRecord>> {
        let state = self.state.read().await;
        Ok(state
            .images
            .values()
            .find(|image| image.object_key == object_key)
            .cloned())
    }

    async fn delete_examination(&self, examination_id: i64) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.examinations.remove(&examination_id).is_none() {
            return Ok(false);
        }
        state
            .diagnoses
            .retain(|_, diagnosis| diagnosis.examination_id != examination_id);
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct Staged {
    patients: Vec<Patient>,
    images: Vec<ImageRecord>,
    examinations: Vec<ExaminationRow>,
    diagnoses: Vec<Diagnosis>,
}

/// 进程内事务，丢弃即回滚
struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    staged: Staged,
}

impl MemoryTransaction {
    fn staged_examination(&self, examination_id: i64) -> bool {
        self.staged.examinations.iter().any(|exam| exam.id == examination_id)
    }
}

#[async_trait]
impl RecordTransaction for MemoryTransaction {
    async fn upsert_patient(&mut self, patient: &NewPatient) -> Result<Patient> {
        if let Some(existing) = self.state.read().await.patients.get(&patient.patient_id) {
            return Ok(existing.clone());
        }
        if let Some(staged) = self
            .staged
            .patients
            .iter()
            .find(|p| p.patient_id == patient.patient_id)
        {
            return Ok(staged.clone());
        }

        let created = patient.clone().into_patient();
        self.staged.patients.push(created.clone());
        Ok(created)
    }

    async fn insert_image(&mut self, object_key: &str) -> Result<ImageRecord> {
        let mut state = self.state.write().await;
        if state.image_key_taken(object_key)
            || self.staged.images.iter().any(|image| image.object_key == object_key)
        {
            return Err(DermError::Database(format!(
                "unique constraint violated (images_object_key_key): {}",
                object_key
            )));
        }

        state.last_image_id += 1;
        let image = ImageRecord {
            id: state.last_image_id,
            object_key: object_key.to_string(),
        };
        self.staged.images.push(image.clone());
        Ok(image)
    }

    async fn insert_examination(&mut self, examination: &NewExamination) -> Result<i64> {
        let mut state = self.state.write().await;

        let patient_known = state.patients.contains_key(&examination.patient_id)
            || self
                .staged
                .patients
                .iter()
                .any(|p| p.patient_id == examination.patient_id);
        if !patient_known {
            return Err(DermError::Database(format!(
                "foreign key violated: patient {} does not exist",
                examination.patient_id
            )));
        }

        let image_known = state.images.contains_key(&examination.image_id)
            || self.staged.images.iter().any(|i| i.id == examination.image_id);
        if !image_known {
            return Err(DermError::Database(format!(
                "foreign key violated: image {} does not exist",
                examination.image_id
            )));
        }

        if state.image_in_use(examination.image_id)
            || self
                .staged
                .examinations
                .iter()
                .any(|exam| exam.image_id == examination.image_id)
        {
            return Err(DermError::Database(format!(
                "unique constraint violated (examinations_image_id_key): {}",
                examination.image_id
            )));
        }

        state.last_examination_id += 1;
        let id = state.last_examination_id;
        self.staged.examinations.push(ExaminationRow {
            id,
            patient_id: examination.patient_id.clone(),
            image_id: examination.image_id,
            prediction: examination.prediction.clone(),
            location: examination.meta.location.clone(),
            date: examination.meta.date,
            doctor: examination.meta.doctor.clone(),
        });
        Ok(id)
    }

    async fn insert_diagnosis(
        &mut self,
        examination_id: i64,
        diagnosis: &NewDiagnosis,
    ) -> Result<Diagnosis> {
        let staged = self.staged_examination(examination_id);
        let mut state = self.state.write().await;
        if !staged && !state.examinations.contains_key(&examination_id) {
            return Err(DermError::Database(format!(
                "foreign key violated: examination {} does not exist",
                examination_id
            )));
        }

        state.last_diagnosis_id += 1;
        let created = Diagnosis {
            id: state.last_diagnosis_id,
            examination_id,
            result: diagnosis.result.clone(),
            doctor: diagnosis.doctor.clone(),
            created_at: Utc::now(),
        };
        self.staged.diagnoses.push(created.clone());
        Ok(created)
    }

    async fn examination_exists(&mut self, examination_id: i64) -> Result<bool> {
        if self.staged_examination(examination_id) {
            return Ok(true);
        }
        Ok(self.state.read().await.examinations.contains_key(&examination_id))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { state, staged } = *self;
        let mut state = state.write().await;

        // 先整体校验，任何冲突都使整个事务失败
        for image in &staged.images {
            if state.image_key_taken(&image.object_key) {
                return Err(DermError::Database(format!(
                    "unique constraint violated (images_object_key_key): {}",
                    image.object_key
                )));
            }
        }
        for exam in &staged.examinations {
            if state.image_in_use(exam.image_id) {
                return Err(DermError::Database(format!(
                    "unique constraint violated (examinations_image_id_key): {}",
                    exam.image_id
                )));
            }
        }
        for diagnosis in &staged.diagnoses {
            let known = state.examinations.contains_key(&diagnosis.examination_id)
                || staged
                    .examinations
                    .iter()
                    .any(|exam| exam.id == diagnosis.examination_id);
            if !known {
                return Err(DermError::Database(format!(
                    "foreign key violated: examination {} does not exist",
                    diagnosis.examination_id
                )));
            }
        }

        // 自然键冲突时保留先提交的一方
        for patient in staged.patients {
            state.patients.entry(patient.patient_id.clone()).or_insert(patient);
        }
        for image in staged.images {
            state.images.insert(image.id, image);
        }
        for exam in staged.examinations {
            state.examinations.insert(exam.id, exam);
        }
        for diagnosis in staged.diagnoses {
            state.diagnoses.insert(diagnosis.id, diagnosis);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use derm_core::{DiagnosticCode, ExaminationMeta, Sex};

    fn new_patient(id: &str, given_name: &str) -> NewPatient {
        NewPatient {
            patient_id: id.to_string(),
            given_name: given_name.to_string(),
            family_name: "Volkova".to_string(),
            middle_name: None,
            sex: Sex::Female,
            age: 35,
        }
    }

    fn new_examination(patient_id: &str, image_id: i64, day: u32) -> NewExamination {
        NewExamination {
            patient_id: patient_id.to_string(),
            image_id,
            prediction: PredictionResult::new(DiagnosticCode::Nv, 0.91),
            meta: ExaminationMeta {
                location: Some("BK".to_string()),
                date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
                doctor: "Dr. Lebedev".to_string(),
            },
        }
    }

    fn diagnosis(result: &str) -> NewDiagnosis {
        NewDiagnosis {
            result: result.to_string(),
            doctor: "Dr. Lebedev".to_string(),
        }
    }

    async fn seed_examination(store: &MemoryRecordStore, patient_id: &str, key: &str, day: u32) -> i64 {
        let mut tx = store.begin().await.unwrap();
        tx.upsert_patient(&new_patient(patient_id, "Olga")).await.unwrap();
        let image = tx.insert_image(key).await.unwrap();
        let id = tx
            .insert_examination(&new_examination(patient_id, image.id, day))
            .await
            .unwrap();
        tx.insert_diagnosis(id, &diagnosis("NV")).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let store = MemoryRecordStore::new();
        let id = seed_examination(&store, "P-1", "k1", 1).await;

        let exam = store.get_examination(id).await.unwrap().unwrap();
        assert_eq!(exam.image.object_key, "k1");
        assert_eq!(exam.diagnoses.len(), 1);
        assert_eq!(exam.patient.given_name, "Olga");
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let store = MemoryRecordStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.upsert_patient(&new_patient("P-2", "Olga")).await.unwrap();
        let image = tx.insert_image("k2").await.unwrap();
        tx.insert_examination(&new_examination("P-2", image.id, 2))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_patient("P-2").await.unwrap().is_none());
        assert!(store.find_image_by_key("k2").await.unwrap().is_none());
        assert!(store.get_examinations_by_patient("P-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_no_rows() {
        let store = MemoryRecordStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert_patient(&new_patient("P-3", "Olga")).await.unwrap();
        }
        assert_eq!(store.patient_count().await, 0);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_rollback() {
        let store = MemoryRecordStore::new();

        let mut tx = store.begin().await.unwrap();
        let discarded = tx.insert_image("k-discarded").await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let kept = tx.insert_image("k-kept").await.unwrap();
        tx.commit().await.unwrap();

        assert!(kept.id > discarded.id);
    }

    #[tokio::test]
    async fn test_first_write_wins_on_patient_race() {
        let store = MemoryRecordStore::new();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.upsert_patient(&new_patient("P-4", "First")).await.unwrap();
        second.upsert_patient(&new_patient("P-4", "Second")).await.unwrap();

        first.commit().await.unwrap();
        second.commit().await.unwrap();

        assert_eq!(store.patient_count().await, 1);
        let patient = store.get_patient("P-4").await.unwrap().unwrap();
        assert_eq!(patient.given_name, "First");
    }

    #[tokio::test]
    async fn test_image_key_and_examination_image_are_unique() {
        let store = MemoryRecordStore::new();
        seed_examination(&store, "P-5", "dup", 3).await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_image("dup").await.is_err());

        let mut tx = store.begin().await.unwrap();
        tx.upsert_patient(&new_patient("P-5", "Olga")).await.unwrap();
        let image = store.find_image_by_key("dup").await.unwrap().unwrap();
        let err = tx
            .insert_examination(&new_examination("P-5", image.id, 3))
            .await
            .unwrap_err();
        assert!(err.is_database());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_diagnoses() {
        let store = MemoryRecordStore::new();
        let id = seed_examination(&store, "P-6", "k6", 4).await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_diagnosis(id, &diagnosis("MEL")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.diagnosis_count().await, 2);

        assert!(store.delete_examination(id).await.unwrap());
        assert_eq!(store.diagnosis_count().await, 0);
        assert!(!store.delete_examination(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_examinations_ordered_by_date_desc() {
        let store = MemoryRecordStore::new();
        let older = seed_examination(&store, "P-7", "k7a", 1).await;
        let newer = seed_examination(&store, "P-7", "k7b", 20).await;

        let exams = store.get_examinations_by_patient("P-7").await.unwrap();
        let ids: Vec<i64> = exams.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![newer, older]);
    }

    #[tokio::test]
    async fn test_diagnosis_requires_examination() {
        let store = MemoryRecordStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(!tx.examination_exists(99).await.unwrap());
        assert!(tx.insert_diagnosis(99, &diagnosis("DF")).await.is_err());
    }
}
