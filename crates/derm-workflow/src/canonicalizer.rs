//! 标签规范化
//!
//! 把分类服务返回的任意标签映射到固定的诊断代码。查找按固定顺序进行：
//! 规范标签本身、同义词表的几种写法、前四个字符、最后是基于原始标签的启发式规则。
//! 全部失败时随机选取代码并给出模拟置信度，结果带 [`CanonicalOutcome::Fallback`] 标记。

use derm_core::{DermError, DiagnosticCode, PredictionResult, Result};
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

/// 兜底分支的置信度区间
pub const FALLBACK_CONFIDENCE_MIN: f64 = 0.7;
pub const FALLBACK_CONFIDENCE_MAX: f64 = 0.99;

/// 同义词表，键已按清洗规则处理（小写、`-` 换成 `_`）
const SYNONYMS: &[(&str, DiagnosticCode)] = &[
    ("benign_keratosis_like_lesions", DiagnosticCode::Bkl),
    ("benign keratosis like lesions", DiagnosticCode::Bkl),
    ("benignkeratosislikelesions", DiagnosticCode::Bkl),
    ("bkl", DiagnosticCode::Bkl),
    ("actinic_keratoses", DiagnosticCode::Ak),
    ("actinic_keratosis", DiagnosticCode::Ak),
    ("actinic keratoses", DiagnosticCode::Ak),
    ("ak", DiagnosticCode::Ak),
    ("akiec", DiagnosticCode::Ak),
    ("basal_cell_carcinoma", DiagnosticCode::Bcc),
    ("basal cell carcinoma", DiagnosticCode::Bcc),
    ("bcc", DiagnosticCode::Bcc),
    ("dermatofibroma", DiagnosticCode::Df),
    ("df", DiagnosticCode::Df),
    ("melanocytic_nevi", DiagnosticCode::Nv),
    ("melanocytic_nevus", DiagnosticCode::Nv),
    ("melanocytic_nevi_n", DiagnosticCode::Nv),
    ("melanocyticnevi", DiagnosticCode::Nv),
    ("nevi", DiagnosticCode::Nv),
    ("nev", DiagnosticCode::Nv),
    ("nevus", DiagnosticCode::Nv),
    ("nv", DiagnosticCode::Nv),
    ("nv_m", DiagnosticCode::Nv),
    ("nv_m_", DiagnosticCode::Nv),
    ("vascular_lesions", DiagnosticCode::Vasc),
    ("vascular lesions", DiagnosticCode::Vasc),
    ("vascularlesions", DiagnosticCode::Vasc),
    ("vasc", DiagnosticCode::Vasc),
    ("melanoma", DiagnosticCode::Mel),
    ("mel", DiagnosticCode::Mel),
];

/// 规范化结果的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalOutcome {
    /// 标签命中了某一条规则
    Matched,
    /// 标签缺失或无法识别，结果为随机模拟
    Fallback,
}

/// 规范化输出
#[derive(Debug, Clone, PartialEq)]
pub struct Canonicalized {
    pub result: PredictionResult,
    pub outcome: CanonicalOutcome,
}

impl Canonicalized {
    pub fn is_fallback(&self) -> bool {
        self.outcome == CanonicalOutcome::Fallback
    }
}

/// 标签规范化器
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    disallowed: Regex,
}

impl Canonicalizer {
    pub fn new() -> Result<Self> {
        let disallowed = Regex::new(r"[^a-z0-9_ ]+")
            .map_err(|e| DermError::Internal(format!("invalid label pattern: {}", e)))?;
        Ok(Self { disallowed })
    }

    /// 把原始预测映射为规范结果，从不失败
    pub fn canonicalize<R: Rng + ?Sized>(
        &self,
        raw_label: Option<&str>,
        raw_confidence: Option<f64>,
        raw_probabilities: Option<&[f64]>,
        rng: &mut R,
    ) -> Canonicalized {
        let Some(code) = raw_label.and_then(|label| self.resolve(label)) else {
            warn!(raw_label = ?raw_label, "Could not normalize label, using fallback prediction");
            return self.fallback(rng);
        };

        let confidence = matched_confidence(raw_confidence, raw_probabilities);
        let result = PredictionResult::new(code, confidence);
        debug!(raw_label = ?raw_label, label = %result.label, confidence = result.confidence, "Prediction normalized");

        Canonicalized {
            result,
            outcome: CanonicalOutcome::Matched,
        }
    }

    /// 随机模拟结果：代码均匀分布，置信度均匀落在 [0.7, 0.99]
    pub fn fallback<R: Rng + ?Sized>(&self, rng: &mut R) -> Canonicalized {
        let code = DiagnosticCode::ALL[rng.gen_range(0..DiagnosticCode::ALL.len())];
        let confidence = rng.gen_range(FALLBACK_CONFIDENCE_MIN..=FALLBACK_CONFIDENCE_MAX);

        Canonicalized {
            result: PredictionResult::new(code, confidence),
            outcome: CanonicalOutcome::Fallback,
        }
    }

    /// 按规则链解析诊断代码
    pub fn resolve(&self, raw_label: &str) -> Option<DiagnosticCode> {
        if let Some(code) = DiagnosticCode::from_label(raw_label) {
            return Some(code);
        }

        let cleaned = self.clean(raw_label);
        let no_spaces = cleaned.replace(' ', "");
        let no_underscores = cleaned.replace('_', "");
        let first_token = cleaned.split_whitespace().next().unwrap_or_default();

        let candidates = [cleaned.as_str(), no_spaces.as_str(), no_underscores.as_str(), first_token];
        if let Some(code) = candidates.iter().find_map(|candidate| lookup(candidate)) {
            return Some(code);
        }

        let prefix: String = no_spaces.chars().take(4).collect();
        if let Some(code) = lookup(&prefix) {
            return Some(code);
        }

        heuristic(raw_label)
    }

    /// 小写、`-` 换成 `_`、去掉 `[a-z0-9_ ]` 以外的字符、去首尾空白
    fn clean(&self, raw_label: &str) -> String {
        let lowered = raw_label.trim().to_lowercase().replace('-', "_");
        self.disallowed.replace_all(&lowered, "").trim().to_string()
    }
}

fn lookup(candidate: &str) -> Option<DiagnosticCode> {
    if candidate.is_empty() {
        return None;
    }
    SYNONYMS
        .iter()
        .find(|(synonym, _)| *synonym == candidate)
        .map(|(_, code)| *code)
}

fn heuristic(raw_label: &str) -> Option<DiagnosticCode> {
    let upper = raw_label.trim().to_uppercase();
    if upper.starts_with("AKIEC") {
        Some(DiagnosticCode::Ak)
    } else if upper.starts_with("NV_M") || upper.contains("NEV") {
        Some(DiagnosticCode::Nv)
    } else if upper.contains("MELANO") {
        Some(DiagnosticCode::Mel)
    } else {
        None
    }
}

/// 命中时的置信度：显式值优先，其次概率最大值，都没有则为 0
fn matched_confidence(raw_confidence: Option<f64>, raw_probabilities: Option<&[f64]>) -> f64 {
    raw_confidence
        .filter(|c| c.is_finite())
        .or_else(|| {
            raw_probabilities?
                .iter()
                .copied()
                .filter(|p| p.is_finite())
                .reduce(f64::max)
        })
        .unwrap_or(0.0)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn canonicalizer() -> Canonicalizer {
        Canonicalizer::new().unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_synonym_variants() {
        let c = canonicalizer();
        let cases = [
            ("melanocytic_Nevi", DiagnosticCode::Nv),
            ("benign_keratosis-like_lesions", DiagnosticCode::Bkl),
            ("Benign Keratosis Like Lesions", DiagnosticCode::Bkl),
            ("actinic_keratoses", DiagnosticCode::Ak),
            ("basal-cell_carcinoma", DiagnosticCode::Bcc),
            ("Basal Cell Carcinoma", DiagnosticCode::Bcc),
            ("dermatofibroma", DiagnosticCode::Df),
            ("vascular_lesions", DiagnosticCode::Vasc),
            ("Vascular Lesions", DiagnosticCode::Vasc),
            ("melanoma", DiagnosticCode::Mel),
            ("MEL", DiagnosticCode::Mel),
            ("  akiec ", DiagnosticCode::Ak),
        ];
        for (label, expected) in cases {
            let out = c.canonicalize(Some(label), Some(0.8), None, &mut rng());
            assert_eq!(out.outcome, CanonicalOutcome::Matched, "label {}", label);
            assert_eq!(out.result.code(), Some(expected), "label {}", label);
            assert_eq!(out.result.confidence, 0.8);
        }
    }

    #[test]
    fn test_lookup_forms_and_prefix() {
        let c = canonicalizer();
        // 去掉空格后命中
        assert_eq!(c.resolve("Melanocytic Nevi"), Some(DiagnosticCode::Nv));
        // 去掉下划线后命中
        assert_eq!(c.resolve("Dermato_Fibroma"), Some(DiagnosticCode::Df));
        // 首个词命中
        assert_eq!(c.resolve("melanoma in situ"), Some(DiagnosticCode::Mel));
        // 前四个字符命中
        assert_eq!(c.resolve("vascular-malformation"), Some(DiagnosticCode::Vasc));
        assert_eq!(c.resolve("NV_M(x)"), Some(DiagnosticCode::Nv));
    }

    #[test]
    fn test_heuristics() {
        let c = canonicalizer();
        assert_eq!(c.resolve("AKIEC-v2"), Some(DiagnosticCode::Ak));
        assert_eq!(c.resolve("Compound nevus, dysplastic"), Some(DiagnosticCode::Nv));
        assert_eq!(c.resolve("superficial-melanotic lesion"), Some(DiagnosticCode::Mel));
    }

    #[test]
    fn test_canonical_label_is_accepted() {
        let c = canonicalizer();
        for code in DiagnosticCode::ALL {
            assert_eq!(c.resolve(&code.label()), Some(code));
        }
    }

    #[test]
    fn test_unknown_label_falls_back() {
        let c = canonicalizer();
        let mut rng = rng();
        for _ in 0..200 {
            let out = c.canonicalize(Some("psoriasis"), Some(0.95), None, &mut rng);
            assert!(out.is_fallback());
            assert!(out.result.confidence >= FALLBACK_CONFIDENCE_MIN);
            assert!(out.result.confidence <= FALLBACK_CONFIDENCE_MAX);
            assert!(out.result.code().is_some());
        }
    }

    #[test]
    fn test_fallback_reaches_every_code() {
        let c = canonicalizer();
        let mut rng = rng();
        let seen: HashSet<DiagnosticCode> = (0..1000)
            .filter_map(|_| c.canonicalize(None, None, None, &mut rng).result.code())
            .collect();
        assert_eq!(seen.len(), DiagnosticCode::ALL.len());
    }

    #[test]
    fn test_missing_label_with_probabilities_falls_back() {
        let c = canonicalizer();
        let out = c.canonicalize(None, None, Some(&[0.1, 0.9]), &mut rng());
        assert!(out.is_fallback());
        assert!(out.result.confidence >= FALLBACK_CONFIDENCE_MIN);
    }

    #[test]
    fn test_confidence_selection() {
        let c = canonicalizer();

        let from_probabilities = c.canonicalize(Some("bcc"), None, Some(&[0.2, 0.65, f64::NAN]), &mut rng());
        assert_eq!(from_probabilities.result.confidence, 0.65);

        let non_finite = c.canonicalize(Some("bcc"), Some(f64::INFINITY), Some(&[0.4]), &mut rng());
        assert_eq!(non_finite.result.confidence, 0.4);

        let absent = c.canonicalize(Some("bcc"), None, None, &mut rng());
        assert_eq!(absent.outcome, CanonicalOutcome::Matched);
        assert_eq!(absent.result.confidence, 0.0);

        let clamped = c.canonicalize(Some("bcc"), Some(3.5), None, &mut rng());
        assert_eq!(clamped.result.confidence, 1.0);

        let rounded = c.canonicalize(Some("bcc"), Some(0.1234567), None, &mut rng());
        assert_eq!(rounded.result.confidence, 0.123457);
    }

    #[test]
    fn test_output_label_round_trips() {
        let c = canonicalizer();
        let mut rng = rng();
        for label in [Some("nevus"), Some("unknown"), None] {
            let out = c.canonicalize(label, None, None, &mut rng);
            let code = DiagnosticCode::from_label(&out.result.label).unwrap();
            assert_eq!(out.result.label, code.label());
        }
    }

    #[test]
    fn test_empty_label_falls_back() {
        let c = canonicalizer();
        assert!(c.canonicalize(Some("  ?? "), None, None, &mut rng()).is_fallback());
    }
}
