//! 基于首个数据块的 MIME 类型识别与下载时的安全类型改写。

pub const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";

const HTML_SIGNATURES: &[&str] = &[
    "<!doctype html",
    "<html",
    "<head",
    "<script",
    "<iframe",
    "<h1",
    "<div",
    "<font",
    "<table",
    "<a",
    "<style",
    "<title",
    "<b",
    "<body",
    "<br",
    "<p",
    "<!--",
];

/// 依次尝试魔数识别、HTML/文本启发式与文件扩展名。
pub fn sniff(chunk: &[u8], file_name: &str) -> String {
    if let Some(kind) = infer::get(chunk) {
        return match kind.matcher_type() {
            infer::MatcherType::Text => format!("{}; charset=utf-8", kind.mime_type()),
            _ => kind.mime_type().to_string(),
        };
    }
    if !chunk.is_empty() {
        if looks_like_html(chunk) {
            return TEXT_HTML.to_string();
        }
        if looks_like_text(chunk) {
            return TEXT_PLAIN.to_string();
        }
    }
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn looks_like_html(chunk: &[u8]) -> bool {
    let start = chunk
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(chunk.len());
    let head = &chunk[start..];
    HTML_SIGNATURES.iter().any(|signature| {
        let signature = signature.as_bytes();
        if head.len() < signature.len() || !head[..signature.len()].eq_ignore_ascii_case(signature)
        {
            return false;
        }
        // 注释不需要结束符，标签后必须是空格或 `>`。
        signature == b"<!--" || matches!(head.get(signature.len()), Some(b' ' | b'>'))
    })
}

/// 合法 UTF-8（允许末尾被截断的多字节字符）且不含二进制控制字符。
fn looks_like_text(chunk: &[u8]) -> bool {
    let valid = match std::str::from_utf8(chunk) {
        Ok(text) => text,
        Err(err) if err.error_len().is_none() => {
            match std::str::from_utf8(&chunk[..err.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    !valid
        .bytes()
        .any(|byte| byte < 0x20 && !matches!(byte, b'\t' | b'\n' | b'\r' | 0x0c))
}

/// 下载时的实际 `Content-Type`：HTML 降级为纯文本，空值、Flash 与 PDF 强制下载。
pub fn served_content_type(mime_type: &str) -> &str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "" | "application/pdf" | "application/x-shockwave-flash" | "application/vnd.adobe.flash-movie" => {
            OCTET_STREAM
        }
        "text/html" | "application/xhtml+xml" => "text/plain",
        _ => mime_type,
    }
}
