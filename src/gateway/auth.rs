use crate::error::AppError;
use axum::http::{HeaderMap, header};

pub(crate) const MSG_NO_KEY: &str =
    "Unauthorized to access this resource. No api-key was provided.";
pub(crate) const MSG_BAD_KEY: &str = "Unauthorized to access this resource";

/// 校验入口凭证：优先 `api-key` 头，其次 `Authorization`（去掉 `Bearer ` 前缀）。
/// 与配置密钥逐字节比较。
pub(crate) fn authenticate(headers: &HeaderMap, auth_key: &str) -> Result<(), AppError> {
    match client_key(headers) {
        None => Err(AppError::Unauthorized(MSG_NO_KEY)),
        Some(key) if key == auth_key => Ok(()),
        Some(_) => Err(AppError::Unauthorized(MSG_BAD_KEY)),
    }
}

fn client_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("api-key").and_then(|v| v.to_str().ok())
        && !v.is_empty()
    {
        return Some(v);
    }

    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    // 前缀区分大小写，对齐 OpenAI 客户端的标准写法。
    let key = auth.strip_prefix("Bearer ").unwrap_or(auth);
    if key.is_empty() { None } else { Some(key) }
}
