//! 诊断分类
//!
//! 固定的七类皮肤病变代码及其显示名称。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DermError;

/// 诊断代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiagnosticCode {
    Nv,   // 黑素细胞痣
    Mel,  // 黑色素瘤
    Bcc,  // 基底细胞癌
    Bkl,  // 良性角化样病变
    Ak,   // 光化性角化病
    Df,   // 皮肤纤维瘤
    Vasc, // 血管病变
}

impl DiagnosticCode {
    /// 全部代码，顺序固定
    pub const ALL: [DiagnosticCode; 7] = [
        DiagnosticCode::Nv,
        DiagnosticCode::Mel,
        DiagnosticCode::Bcc,
        DiagnosticCode::Bkl,
        DiagnosticCode::Ak,
        DiagnosticCode::Df,
        DiagnosticCode::Vasc,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            DiagnosticCode::Nv => "NV",
            DiagnosticCode::Mel => "MEL",
            DiagnosticCode::Bcc => "BCC",
            DiagnosticCode::Bkl => "BKL",
            DiagnosticCode::Ak => "AK",
            DiagnosticCode::Df => "DF",
            DiagnosticCode::Vasc => "VASC",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DiagnosticCode::Nv => "Melanocytic nevi",
            DiagnosticCode::Mel => "Melanoma",
            DiagnosticCode::Bcc => "Basal cell carcinoma",
            DiagnosticCode::Bkl => "Benign keratosis-like lesions",
            DiagnosticCode::Ak => "Actinic keratoses",
            DiagnosticCode::Df => "Dermatofibroma",
            DiagnosticCode::Vasc => "Vascular lesions",
        }
    }

    /// 持久化用的标签：`<显示名称> (<代码>)`
    pub fn label(&self) -> String {
        format!("{} ({})", self.display_name(), self.code())
    }

    /// 从 `<显示名称> (<代码>)` 形式的标签中解析代码
    ///
    /// 只认括号内的代码，且显示名称必须与代码一致。
    pub fn from_label(label: &str) -> Option<Self> {
        let trimmed = label.trim();
        let inner = trimmed.strip_suffix(')')?;
        let open = inner.rfind('(')?;
        let code: DiagnosticCode = inner[open + 1..].parse().ok()?;
        let name = inner[..open].trim_end();
        (name == code.display_name()).then_some(code)
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DiagnosticCode {
    type Err = DermError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiagnosticCode::ALL
            .into_iter()
            .find(|code| code.code() == s)
            .ok_or_else(|| DermError::Validation(format!("unknown diagnostic code: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let mut codes: Vec<&str> = DiagnosticCode::ALL.iter().map(|c| c.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 7);
    }

    #[test]
    fn test_label_round_trip() {
        for code in DiagnosticCode::ALL {
            assert_eq!(DiagnosticCode::from_label(&code.label()), Some(code));
        }
        assert_eq!(
            DiagnosticCode::Bkl.label(),
            "Benign keratosis-like lesions (BKL)"
        );
    }

    #[test]
    fn test_from_label_rejects_foreign_values() {
        assert_eq!(DiagnosticCode::from_label("Melanoma (XYZ)"), None);
        assert_eq!(DiagnosticCode::from_label("Melanoma (NV)"), None);
        assert_eq!(DiagnosticCode::from_label("MEL"), None);
        assert_eq!(DiagnosticCode::from_label(""), None);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("VASC".parse::<DiagnosticCode>().unwrap(), DiagnosticCode::Vasc);
        assert!("vasc".parse::<DiagnosticCode>().is_err());
    }

    #[test]
    fn test_serde_uses_code() {
        let json = serde_json::to_string(&DiagnosticCode::Vasc).unwrap();
        assert_eq!(json, "\"VASC\"");
    }
}
