//! 结构化结果的本地修复
//!
//! LLM 常在 JSON 前后夹带解释文字、Markdown 代码块或原始控制字符。
//! 这里只做有界的本地修复：去代码块、截取最外层匹配括号、剔除控制字符。

use serde_json::Value;

/// 直接解析；失败则本地修复后再解析一次
pub fn parse_with_local_repair(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(v) => Ok(v),
        Err(first) => {
            let repaired = local_repair(raw).ok_or_else(|| format!("{first}: no JSON found"))?;
            serde_json::from_str::<Value>(&repaired).map_err(|e| format!("{e}: {repaired}"))
        }
    }
}

/// 本地修复：返回候选 JSON 文本；找不到括号时返回 None
pub fn local_repair(raw: &str) -> Option<String> {
    let body = strip_code_fence(raw);
    let extracted = extract_outermost(body)?;
    Some(strip_control_chars(extracted))
}

/// 去掉 ```json ... ``` 包裹
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let rest = &trimmed[start + 3..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    match rest.find("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

/// 截取第一个 `{` 或 `[` 到与之匹配的闭括号；字符串内的括号不计数。
/// 未闭合时退化为截到最后一个同类闭括号。
pub fn extract_outermost(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let open = text[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// JSON 字符串内不允许出现原始控制字符；统一替换为空格
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_chatter() {
        let raw = "Sure! Here is the plan:\n{\"steps\": [\"a\", \"b\"]}\nHope it helps {maybe}";
        let v = parse_with_local_repair(raw).unwrap();
        assert_eq!(v["steps"][1], "b");
    }

    #[test]
    fn test_brace_inside_string_not_counted() {
        let raw = r#"prefix {"text": "use } carefully", "n": 1} suffix"#;
        assert_eq!(
            extract_outermost(raw),
            Some(r#"{"text": "use } carefully", "n": 1}"#)
        );
    }

    #[test]
    fn test_code_fence_and_control_chars() {
        let raw = "```json\n{\"answer\": \"line\u{0007}break\"}\n```";
        let v = parse_with_local_repair(raw).unwrap();
        assert_eq!(v["answer"], "line break");
    }

    #[test]
    fn test_array_root() {
        let v = parse_with_local_repair("steps: [\"open\", \"click\"] done").unwrap();
        assert!(v.is_array());
    }

    #[test]
    fn test_unrepairable() {
        assert!(parse_with_local_repair("no json here at all").is_err());
        assert!(parse_with_local_repair("{\"a\": }").is_err());
    }
}
