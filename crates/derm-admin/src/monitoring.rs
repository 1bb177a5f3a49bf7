//! 入库流程指标
//!
//! 指标注册在独立的 Prometheus registry 中，由 `/metrics` 导出。

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// 入库流程监控器
#[derive(Debug, Clone)]
pub struct IngestionMonitor {
    registry: Registry,
    ingestions_total: IntCounterVec,
    predictions_total: IntCounterVec,
    orphaned_blobs_total: IntCounter,
    diagnoses_appended_total: IntCounter,
}

impl IngestionMonitor {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ingestions_total = IntCounterVec::new(
            Opts::new("derm_ingestions_total", "Ingestion attempts by outcome"),
            &["outcome"],
        )?;

        let predictions_total = IntCounterVec::new(
            Opts::new("derm_predictions_total", "Predictions by source"),
            &["source"],
        )?;

        let orphaned_blobs_total = IntCounter::with_opts(Opts::new(
            "derm_orphaned_blobs_total",
            "Uploaded objects left without a relational record",
        ))?;

        let diagnoses_appended_total = IntCounter::with_opts(Opts::new(
            "derm_diagnoses_appended_total",
            "Diagnoses appended to existing examinations",
        ))?;

        // 注册所有指标
        registry.register(Box::new(ingestions_total.clone()))?;
        registry.register(Box::new(predictions_total.clone()))?;
        registry.register(Box::new(orphaned_blobs_total.clone()))?;
        registry.register(Box::new(diagnoses_appended_total.clone()))?;

        Ok(Self {
            registry,
            ingestions_total,
            predictions_total,
            orphaned_blobs_total,
            diagnoses_appended_total,
        })
    }

    pub fn record_ingestion(&self, outcome: &str) {
        self.ingestions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_prediction(&self, source: &str) {
        self.predictions_total.with_label_values(&[source]).inc();
    }

    pub fn record_orphaned_blob(&self) {
        self.orphaned_blobs_total.inc();
    }

    pub fn record_diagnosis_appended(&self) {
        self.diagnoses_appended_total.inc();
    }

    pub fn ingestions(&self, outcome: &str) -> u64 {
        self.ingestions_total.with_label_values(&[outcome]).get()
    }

    pub fn predictions(&self, source: &str) -> u64 {
        self.predictions_total.with_label_values(&[source]).get()
    }

    pub fn orphaned_blobs(&self) -> u64 {
        self.orphaned_blobs_total.get()
    }

    pub fn diagnoses_appended(&self) -> u64 {
        self.diagnoses_appended_total.get()
    }

    /// 以 Prometheus 文本格式导出
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent_per_instance() {
        let first = IngestionMonitor::new().unwrap();
        let second = IngestionMonitor::new().unwrap();

        first.record_ingestion("success");
        first.record_orphaned_blob();

        assert_eq!(first.ingestions("success"), 1);
        assert_eq!(second.ingestions("success"), 0);
        assert_eq!(first.orphaned_blobs(), 1);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let monitor = IngestionMonitor::new().unwrap();
        monitor.record_prediction("fallback");
        monitor.record_diagnosis_appended();

        let text = monitor.render().unwrap();
        assert!(text.contains("derm_predictions_total{source=\"fallback\"} 1"));
        assert!(text.contains("derm_diagnoses_appended_total 1"));
        assert!(text.contains("derm_orphaned_blobs_total 0"));
    }
}
