//! 测试用的故障注入存储和桩分类器

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use derm_core::{
    DermError, Diagnosis, Examination, ImageRecord, NewDiagnosis, NewPatient, Patient, Result,
};
use derm_database::{MemoryRecordStore, NewExamination, RecordStore, RecordTransaction};
use derm_integration::{Classifier, PredictionError, RawPrediction};
use derm_storage::{BlobStore, StoredBlob};

/// 故障注入点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    None,
    /// 开启事务时长时间挂起
    StallBegin,
    InsertExamination,
    Commit,
}

/// 在指定步骤失败的关系存储，其余操作委托给内存实现
pub struct FaultyRecordStore {
    inner: MemoryRecordStore,
    fail: FailPoint,
}

impl FaultyRecordStore {
    pub fn new(inner: MemoryRecordStore, fail: FailPoint) -> Self {
        Self { inner, fail }
    }
}

#[async_trait]
impl RecordStore for FaultyRecordStore {
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>> {
        if self.fail == FailPoint::StallBegin {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            fail: self.fail,
        }))
    }

    async fn get_examination(&self, examination_id: i64) -> Result<Option<Examination>> {
        self.inner.get_examination(examination_id).await
    }

    async fn get_examinations_by_patient(&self, patient_id: &str) -> Result<Vec<Examination>> {
        self.inner.get_examinations_by_patient(patient_id).await
    }

    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>> {
        self.inner.get_patient(patient_id).await
    }

    async fn get_image(&self, image_id: i64) -> Result<Option<ImageRecord>> {
        self.inner.get_image(image_id).await
    }

    async fn find_image_by_key(&self, object_key: &str) -> Result<Option<ImageRecord>> {
        self.inner.find_image_by_key(object_key).await
    }

    async fn delete_examination(&self, examination_id: i64) -> Result<bool> {
        self.inner.delete_examination(examination_id).await
    }
}

struct FaultyTransaction {
    inner: Box<dyn RecordTransaction>,
    fail: FailPoint,
}

#[async_trait]
impl RecordTransaction for FaultyTransaction {
    async fn upsert_patient(&mut self, patient: &NewPatient) -> Result<Patient> {
        self.inner.upsert_patient(patient).await
    }

    async fn insert_image(&mut self, object_key: &str) -> Result<ImageRecord> {
        self.inner.insert_image(object_key).await
    }

    async fn insert_examination(&mut self, examination: &NewExamination) -> Result<i64> {
        if self.fail == FailPoint::InsertExamination {
            return Err(DermError::Database("injected examination insert failure".to_string()));
        }
        self.inner.insert_examination(examination).await
    }

    async fn insert_diagnosis(
        &mut self,
        examination_id: i64,
        diagnosis: &NewDiagnosis,
    ) -> Result<Diagnosis> {
        self.inner.insert_diagnosis(examination_id, diagnosis).await
    }

    async fn examination_exists(&mut self, examination_id: i64) -> Result<bool> {
        self.inner.examination_exists(examination_id).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail == FailPoint::Commit {
            self.inner.rollback().await?;
            return Err(DermError::Database("injected commit failure".to_string()));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

/// 写入总是失败的对象存储
pub struct FailingBlobStore;

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, _data: Bytes, _content_type: &str) -> Result<StoredBlob> {
        Err(DermError::Storage(format!("injected upload failure for {}", key)))
    }

    async fn presigned_get(&self, key: &str, _ttl: Duration) -> Result<String> {
        Err(DermError::Storage(format!("injected presign failure for {}", key)))
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
}

/// 返回固定结果的分类器
pub struct StubClassifier {
    response: Option<RawPrediction>,
    calls: Arc<AtomicUsize>,
}

impl StubClassifier {
    pub fn returning(raw: RawPrediction) -> Self {
        Self {
            response: Some(raw),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn label(label: &str, confidence: f64) -> Self {
        Self::returning(RawPrediction {
            label: Some(label.to_string()),
            confidence: Some(confidence),
            probabilities: None,
        })
    }

    /// 每次调用都超时
    pub fn timing_out() -> Self {
        Self {
            response: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn predict(&self, _image: &[u8]) -> std::result::Result<RawPrediction, PredictionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .clone()
            .ok_or_else(|| PredictionError::Timeout("stub read timeout".to_string()))
    }
}
