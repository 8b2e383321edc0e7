use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// 解析代码列表：每行一个，忽略空行和 `#` 注释，逗号/分号分隔的行取第一列
pub fn parse_codes(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split([',', ';', '\t']).next())
        .map(|code| code.trim().trim_matches('"').to_string())
        .filter(|code| !code.is_empty() && !code.eq_ignore_ascii_case("nan"))
        .collect()
}

/// 从文本文件加载待处理代码
pub async fn load_codes(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取代码文件: {}", path.display()))?;
    let codes = parse_codes(&content);
    tracing::info!("✓ 从 {} 读取到 {} 个代码", path.display(), codes.len());
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_codes_skips_noise() {
        let content = "# GTIN\n5901234123457\n\n  400638133393 \nnan\n\"123\",9.99\n";
        assert_eq!(
            parse_codes(content),
            vec!["5901234123457", "400638133393", "123"]
        );
    }
}
