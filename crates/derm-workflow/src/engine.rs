//! 入库工作流引擎
//!
//! 一次入库跨越两个独立失败的后端：先把影像写入对象存储，再在一个关系库事务里
//! 写入患者、影像、检查和首条诊断。对象存储没有回滚，事务失败后已上传的对象
//! 作为孤儿对象记录日志和指标，不做删除。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use derm_admin::IngestionMonitor;
use derm_core::utils::generate_image_key;
use derm_core::{
    round_confidence, DermError, Diagnosis, Examination, ExaminationMeta, NewDiagnosis,
    NewPatient, PredictionMode, PredictionResult, Result,
};
use derm_database::{NewExamination, RecordStore, RecordTransaction};
use derm_integration::{Classifier, RawPrediction};
use derm_storage::BlobStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::canonicalizer::{CanonicalOutcome, Canonicalized, Canonicalizer};

const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// 预测结果的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionSource {
    /// 分类服务的标签命中规则
    Matched,
    /// 随机模拟
    Fallback,
    /// 调用方直接提供
    Supplied,
}

impl PredictionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::Matched => "matched",
            PredictionSource::Fallback => "fallback",
            PredictionSource::Supplied => "supplied",
        }
    }
}

impl From<CanonicalOutcome> for PredictionSource {
    fn from(outcome: CanonicalOutcome) -> Self {
        match outcome {
            CanonicalOutcome::Matched => PredictionSource::Matched,
            CanonicalOutcome::Fallback => PredictionSource::Fallback,
        }
    }
}

/// 待上传的影像
#[derive(Debug, Clone)]
pub struct ImageUpload {
    /// 对象键，每次入库都必须是新键
    pub key: String,
    pub data: Bytes,
    pub content_type: String,
}

impl ImageUpload {
    /// 按原始文件名生成新的对象键
    pub fn new(original_filename: &str, data: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            key: generate_image_key(original_filename),
            data,
            content_type: content_type.into(),
        }
    }
}

/// 一次入库请求
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    pub patient: NewPatient,
    pub examination: ExaminationMeta,
    pub diagnosis: NewDiagnosis,
    pub image: ImageUpload,
    /// 调用方已经拿到的预测（先分析后保存）；为空时由引擎获取
    pub prediction: Option<PredictionResult>,
}

impl IngestionRequest {
    /// 在任何副作用之前校验全部输入
    pub fn validate(&self) -> Result<()> {
        self.patient.validate()?;
        self.examination.validate()?;
        self.diagnosis.validate()?;
        if let Some(prediction) = &self.prediction {
            prediction.validate()?;
        }
        if self.image.data.is_empty() {
            return Err(DermError::Validation("image is empty".to_string()));
        }
        if self.image.key.trim().is_empty() {
            return Err(DermError::Validation("image key is empty".to_string()));
        }
        Ok(())
    }
}

/// 入库结果
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReceipt {
    pub examination: Examination,
    pub prediction_source: PredictionSource,
}

/// 入库工作流引擎
pub struct IngestionEngine {
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    classifier: Option<Arc<dyn Classifier>>,
    canonicalizer: Canonicalizer,
    monitor: IngestionMonitor,
    mode: PredictionMode,
    presign_ttl: Duration,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for IngestionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionEngine")
            .field("mode", &self.mode)
            .field("classifier", &self.classifier.is_some())
            .field("presign_ttl", &self.presign_ttl)
            .finish()
    }
}

impl IngestionEngine {
    /// 创建引擎，默认不调用分类服务
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        monitor: IngestionMonitor,
    ) -> Result<Self> {
        Ok(Self {
            records,
            blobs,
            classifier: None,
            canonicalizer: Canonicalizer::new()?,
            monitor,
            mode: PredictionMode::Simulated,
            presign_ttl: DEFAULT_PRESIGN_TTL,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// 使用远程分类服务
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self.mode = PredictionMode::Remote;
        self
    }

    pub fn with_mode(mut self, mode: PredictionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = ttl;
        self
    }

    /// 固定随机种子，使兜底结果可复现
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn mode(&self) -> PredictionMode {
        self.mode
    }

    pub fn monitor(&self) -> &IngestionMonitor {
        &self.monitor
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 获取规范化预测，从不失败
    ///
    /// 分类服务不可用时记录警告并走兜底分支。
    pub async fn predict(&self, image: &[u8]) -> Canonicalized {
        let classifier = match (self.mode, &self.classifier) {
            (PredictionMode::Remote, Some(classifier)) => classifier,
            (PredictionMode::Remote, None) => {
                warn!("Remote prediction requested without a classifier, simulating");
                return self.simulate();
            }
            (PredictionMode::Simulated, _) => return self.simulate(),
        };

        match classifier.predict(image).await {
            Ok(raw) => self.canonicalize(&raw),
            Err(e) => {
                let unavailable = DermError::from(e);
                warn!(error = %unavailable, "Using fallback prediction");
                self.simulate()
            }
        }
    }

    fn simulate(&self) -> Canonicalized {
        self.canonicalizer.fallback(&mut *self.rng())
    }

    fn canonicalize(&self, raw: &RawPrediction) -> Canonicalized {
        self.canonicalizer.canonicalize(
            raw.label.as_deref(),
            raw.confidence,
            raw.probabilities.as_deref(),
            &mut *self.rng(),
        )
    }

    /// 完整入库
    ///
    /// 先上传对象，再在单个事务中写入全部关系记录。事务失败时回滚并上报孤儿对象。
    pub async fn ingest(&self, request: IngestionRequest) -> Result<IngestionReceipt> {
        if let Err(e) = request.validate() {
            self.monitor.record_ingestion("rejected");
            return Err(e);
        }

        let IngestionRequest {
            patient,
            examination,
            diagnosis,
            image,
            prediction,
        } = request;

        // 预测在任何存储操作之前完成
        let (prediction, source) = match prediction {
            Some(supplied) => (
                PredictionResult {
                    confidence: round_confidence(supplied.confidence),
                    ..supplied
                },
                PredictionSource::Supplied,
            ),
            None => {
                let canonical = self.predict(&image.data).await;
                (canonical.result, PredictionSource::from(canonical.outcome))
            }
        };
        self.monitor.record_prediction(source.as_str());

        if let Err(e) = self
            .blobs
            .put(&image.key, image.data.clone(), &image.content_type)
            .await
        {
            error!(object_key = %image.key, error = %e, "Image upload failed, nothing persisted");
            self.monitor.record_ingestion("storage_failure");
            return Err(e);
        }
        // 上传成功后，future 在提交前被丢弃也要上报孤儿对象
        let orphan_guard = OrphanGuard::arm(&self.monitor, &image.key);

        let new_examination = NewExamination {
            patient_id: patient.patient_id.clone(),
            image_id: 0,
            prediction,
            meta: examination,
        };

        let examination_id = match self
            .persist(&patient, &image.key, new_examination, &diagnosis)
            .await
        {
            Ok(id) => {
                orphan_guard.disarm();
                id
            }
            Err(e) => {
                orphan_guard.disarm();
                error!(
                    object_key = %image.key,
                    error = %e,
                    "Orphaned blob: relational write failed after upload"
                );
                self.monitor.record_orphaned_blob();
                self.monitor.record_ingestion("database_failure");
                return Err(e);
            }
        };

        // 事务已提交，此后的失败不再产生孤儿对象
        let examination = match self.records.get_examination(examination_id).await {
            Ok(Some(examination)) => examination,
            Ok(None) => {
                self.monitor.record_ingestion("database_failure");
                return Err(DermError::Internal(format!(
                    "examination {} missing right after commit",
                    examination_id
                )));
            }
            Err(e) => {
                self.monitor.record_ingestion("database_failure");
                return Err(e);
            }
        };

        self.monitor.record_ingestion("success");
        info!(
            examination_id,
            object_key = %image.key,
            prediction_source = source.as_str(),
            label = %examination.prediction.label,
            "Examination ingested"
        );

        Ok(IngestionReceipt {
            examination,
            prediction_source: source,
        })
    }

    /// 单事务写入患者、影像、检查和首条诊断，返回检查ID
    async fn persist(
        &self,
        patient: &NewPatient,
        object_key: &str,
        mut examination: NewExamination,
        diagnosis: &NewDiagnosis,
    ) -> Result<i64> {
        let mut tx = self.records.begin().await?;

        let written = async {
            tx.upsert_patient(patient).await?;
            let image = tx.insert_image(object_key).await?;
            examination.image_id = image.id;
            let examination_id = tx.insert_examination(&examination).await?;
            tx.insert_diagnosis(examination_id, diagnosis).await?;
            Ok::<_, DermError>(examination_id)
        }
        .await;

        match written {
            Ok(examination_id) => {
                tx.commit().await?;
                Ok(examination_id)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    /// 为已有检查追加诊断
    pub async fn append_diagnosis(
        &self,
        examination_id: i64,
        diagnosis: NewDiagnosis,
    ) -> Result<Diagnosis> {
        diagnosis.validate()?;

        let mut tx = self.records.begin().await?;
        let written = async {
            if !tx.examination_exists(examination_id).await? {
                return Err(DermError::NotFound(format!("examination {}", examination_id)));
            }
            tx.insert_diagnosis(examination_id, &diagnosis).await
        }
        .await;

        let created = match written {
            Ok(created) => created,
            Err(e) => {
                rollback(tx).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        self.monitor.record_diagnosis_appended();
        info!(examination_id, diagnosis_id = created.id, "Diagnosis appended");
        Ok(created)
    }

    /// 读取检查及其诊断
    pub async fn get_examination(&self, examination_id: i64) -> Result<Examination> {
        self.records
            .get_examination(examination_id)
            .await?
            .ok_or_else(|| DermError::NotFound(format!("examination {}", examination_id)))
    }

    /// 患者的全部检查，按日期倒序；未知患者返回空列表
    pub async fn examinations_for_patient(&self, patient_id: &str) -> Result<Vec<Examination>> {
        self.records.get_examinations_by_patient(patient_id).await
    }

    /// 影像的限时访问链接
    pub async fn image_url(&self, image_id: i64) -> Result<String> {
        let image = self
            .records
            .get_image(image_id)
            .await?
            .ok_or_else(|| DermError::NotFound(format!("image {}", image_id)))?;

        self.blobs
            .presigned_get(&image.object_key, self.presign_ttl)
            .await
    }
}

/// 上传完成到事务提交之间的取消守卫
struct OrphanGuard<'a> {
    monitor: &'a IngestionMonitor,
    object_key: &'a str,
    armed: bool,
}

impl<'a> OrphanGuard<'a> {
    fn arm(monitor: &'a IngestionMonitor, object_key: &'a str) -> Self {
        Self {
            monitor,
            object_key,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OrphanGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            error!(
                object_key = %self.object_key,
                "Orphaned blob: ingestion cancelled after upload"
            );
            self.monitor.record_orphaned_blob();
            self.monitor.record_ingestion("cancelled");
        }
    }
}

async fn rollback(tx: Box<dyn RecordTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed, transaction discarded");
    }
}
