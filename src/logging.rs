use axum::http::HeaderMap;

/// 凭证类请求头，输出日志前统一脱敏（名称均为小写）。
const REDACTED_HEADERS: [&str; 3] = ["api-key", "authorization", "proxy-authorization"];

/// 把请求头格式化为多行 `name: value` 文本，凭证字段以 *** 代替。
pub fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        out.push_str(key);
        out.push_str(": ");
        if REDACTED_HEADERS.contains(&key) {
            out.push_str("***");
        } else {
            out.push_str(value.to_str().unwrap_or("<binary>"));
        }
        out.push('\n');
    }
    out
}
