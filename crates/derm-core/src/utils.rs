//! 通用工具函数

use uuid::Uuid;

const MAX_FILENAME_LEN: usize = 128;

/// 生成唯一的影像对象键：`<uuid>_<清洗后的文件名>`
///
/// 每次调用都会得到新键；重试失败的入库时必须重新生成。
pub fn generate_image_key(original_filename: &str) -> String {
    format!("{}_{}", Uuid::new_v4(), sanitize_filename(original_filename))
}

/// 去掉路径部分，仅保留安全字符
pub fn sanitize_filename(original_filename: &str) -> String {
    let base = original_filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 验证对象键格式
pub fn is_valid_image_key(key: &str) -> bool {
    match key.split_once('_') {
        Some((id, name)) => Uuid::parse_str(id).is_ok() && !name.is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_image_key() {
        let key = generate_image_key("ISIC_0024306.jpg");
        assert!(is_valid_image_key(&key));
        assert!(key.ends_with("_ISIC_0024306.jpg"));
        assert_ne!(key, generate_image_key("ISIC_0024306.jpg"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\photos\\mole 1.png"), "mole_1.png");
        assert_eq!(sanitize_filename(""), "image");
        assert_eq!(sanitize_filename(".."), "image");
    }

    #[test]
    fn test_is_valid_image_key() {
        assert!(!is_valid_image_key("no-uuid_here.jpg"));
        assert!(!is_valid_image_key(""));
    }
}
