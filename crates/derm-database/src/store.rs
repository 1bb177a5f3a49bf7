//! 存储接口
//!
//! 入库流程只依赖这里的两个 trait，具体后端通过依赖注入提供。

use async_trait::async_trait;
use derm_core::{Diagnosis, Examination, ImageRecord, NewDiagnosis, NewPatient, Patient, Result};

use crate::models::NewExamination;

/// 关系存储
///
/// 患者自然键唯一、检查对影像唯一、删除检查级联删除诊断。
/// 同一自然键的并发写入由唯一约束裁决，失败方重新读取已存在的行。
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 开启事务
    async fn begin(&self) -> Result<Box<dyn RecordTransaction>>;

    /// 按ID读取检查及其诊断
    async fn get_examination(&self, examination_id: i64) -> Result<Option<Examination>>;

    /// 读取患者的全部检查，按检查日期倒序
    async fn get_examinations_by_patient(&self, patient_id: &str) -> Result<Vec<Examination>>;

    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>>;

    async fn get_image(&self, image_id: i64) -> Result<Option<ImageRecord>>;

    async fn find_image_by_key(&self, object_key: &str) -> Result<Option<ImageRecord>>;

    /// 删除检查，诊断随之删除；返回是否存在
    async fn delete_examination(&self, examination_id: i64) -> Result<bool>;
}

/// 一次关系库事务
///
/// 每个写操作立即下发（相当于 flush），以便拿到生成的ID。
/// 未提交就丢弃时等同回滚。
#[async_trait]
pub trait RecordTransaction: Send {
    /// 按自然键插入患者；已存在时返回已有记录
    async fn upsert_patient(&mut self, patient: &NewPatient) -> Result<Patient>;

    async fn insert_image(&mut self, object_key: &str) -> Result<ImageRecord>;

    /// 返回新检查ID
    async fn insert_examination(&mut self, examination: &NewExamination) -> Result<i64>;

    async fn insert_diagnosis(
        &mut self,
        examination_id: i64,
        diagnosis: &NewDiagnosis,
    ) -> Result<Diagnosis>;

    /// 检查是否存在，并在事务内锁定该行
    async fn examination_exists(&mut self, examination_id: i64) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
