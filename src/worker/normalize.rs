//! 代码归一化
//!
//! 外部服务只接受固定宽度的纯数字代码。表格导出的代码经常带空格、
//! 被写成科学计数法（`5.901234123457E+12`）或丢了前导零。

/// 把一个代码归一化为 `width` 位数字；无法归一化时返回 `None`
pub fn normalize_code(raw: &str, width: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return None;
    }

    let expanded = expand_scientific(trimmed).unwrap_or_else(|| trimmed.to_string());
    let mut digits: String = expanded.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.truncate(width);
    Some(format!("{:0>width$}", digits, width = width))
}

/// 归一化整个批次，丢弃无法归一化的代码
pub fn normalize_batch(codes: &[String], width: usize) -> Vec<String> {
    codes
        .iter()
        .filter_map(|code| normalize_code(code, width))
        .collect()
}

/// `1.23E+12` → `1230000000000`；不是科学计数法时返回 `None`
fn expand_scientific(s: &str) -> Option<String> {
    let upper = s.to_ascii_uppercase();
    let (mantissa, exponent) = upper.split_once('E')?;
    let exponent: i32 = exponent.trim_start_matches('+').parse().ok()?;
    if !(0..=30).contains(&exponent) {
        return None;
    }

    let mantissa = mantissa.trim_start_matches('+');
    let (int_part, frac_part) = mantissa.split_once(['.', ',']).unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let shift = exponent as usize;
    let mut digits = format!("{int_part}{frac_part}");
    if frac_part.len() <= shift {
        digits.push_str(&"0".repeat(shift - frac_part.len()));
    } else {
        // 小数部分超出指数位数，舍去剩余的小数位
        digits.truncate(int_part.len() + shift);
    }
    Some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pads_short_codes() {
        assert_eq!(normalize_code("400638133393", 13).unwrap(), "0400638133393");
    }

    #[test]
    fn test_strips_whitespace_and_noise() {
        assert_eq!(normalize_code("  5901-2341 23457 ", 13).unwrap(), "5901234123457");
    }

    #[test]
    fn test_expands_scientific_notation() {
        assert_eq!(normalize_code("5.901234123457E+12", 13).unwrap(), "5901234123457");
        assert_eq!(normalize_code("1.23e12", 13).unwrap(), "1230000000000");
    }

    #[test]
    fn test_truncates_long_codes() {
        assert_eq!(normalize_code("12345678901234567", 13).unwrap(), "1234567890123");
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(normalize_code("   ", 13), None);
        assert_eq!(normalize_code("nan", 13), None);
        assert_eq!(normalize_code("abc", 13), None);
    }

    #[test]
    fn test_normalize_batch_drops_invalid() {
        let codes = vec!["123".to_string(), "n/a".to_string(), "".to_string()];
        assert_eq!(normalize_batch(&codes, 5), vec!["00123"]);
    }
}
