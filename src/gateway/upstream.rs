use crate::config::Config;
use crate::endpoint_pool::EndpointConnection;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, Uri, header};
use std::time::Duration;

/// 建连与 TLS 握手超时，取自 OpenAI 文档的建议值。
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const HEADER_REMAINING_TOKENS: &str = "X-Ratelimit-Remaining-Tokens";
pub(crate) const HEADER_REMAINING_REQUESTS: &str = "X-Ratelimit-Remaining-Requests";
pub(crate) const HEADER_RESET_TOKENS: &str = "X-Ratelimit-Reset-Tokens";
pub(crate) const HEADER_RESET_REQUESTS: &str = "X-Ratelimit-Reset-Requests";

/// 上游共享 HTTP 客户端：一个连接池，超时取配置值。
#[derive(Debug, Clone)]
pub(crate) struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(cfg.timeout())
            .build()?;
        Ok(Self { http })
    }

    /// 把缓冲后的客户端请求改写到指定端点并发送。
    ///
    /// scheme/host 取自端点 URL，路径与查询串保持客户端原样；
    /// `api-key` 覆盖为端点自己的凭证，后端密钥不经过客户端。
    pub async fn forward(
        &self,
        endpoint: &EndpointConnection,
        method: Method,
        original: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut url = endpoint.url.clone();
        url.set_path(original.path());
        url.set_query(original.query());

        let mut headers = headers.clone();
        // Host 与请求体框架头按目标端点重新生成。
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        if let Ok(key) = HeaderValue::from_str(&endpoint.key) {
            headers.insert("api-key", key);
        }

        self.http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
    }
}

/// 上游响应里的四个速率限制头；缺失或非数字一律按 0 处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RateLimitInfo {
    pub remaining_tokens: i64,
    pub remaining_requests: i64,
    pub reset_tokens: i64,
    pub reset_requests: i64,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            remaining_tokens: header_int(headers, HEADER_REMAINING_TOKENS),
            remaining_requests: header_int(headers, HEADER_REMAINING_REQUESTS),
            reset_tokens: header_int(headers, HEADER_RESET_TOKENS),
            reset_requests: header_int(headers, HEADER_RESET_REQUESTS),
        }
    }

    /// 任一维度余额归零即视为端点耗尽。
    pub fn exhausted(&self) -> bool {
        self.remaining_requests == 0 || self.remaining_tokens == 0
    }

    /// 耗尽时的退避秒数：取两个 reset 值的较大者；都缺失时默认 59
    /// （调用方再 +1，凑满一分钟）。
    pub fn backoff_secs(&self) -> i64 {
        let backoff = self.reset_tokens.max(self.reset_requests);
        if backoff == 0 { 59 } else { backoff }
    }
}

fn header_int(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|v| v.max(0))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(name, value) in entries {
            map.insert(name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn parses_all_four_headers() {
        let h = headers(&[
            ("X-Ratelimit-Remaining-Tokens", "9990"),
            ("X-Ratelimit-Remaining-Requests", "99"),
            ("X-Ratelimit-Reset-Tokens", "10"),
            ("X-Ratelimit-Reset-Requests", "30"),
        ]);
        let info = RateLimitInfo::from_headers(&h);
        assert_eq!(info.remaining_tokens, 9990);
        assert_eq!(info.remaining_requests, 99);
        assert_eq!(info.reset_tokens, 10);
        assert_eq!(info.reset_requests, 30);
        assert!(!info.exhausted());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = headers(&[("x-ratelimit-remaining-tokens", "5")]);
        assert_eq!(RateLimitInfo::from_headers(&h).remaining_tokens, 5);
    }

    #[test]
    fn missing_or_garbage_values_become_zero() {
        let h = headers(&[("X-Ratelimit-Remaining-Tokens", "plenty")]);
        let info = RateLimitInfo::from_headers(&h);
        assert_eq!(info.remaining_tokens, 0);
        assert_eq!(info.remaining_requests, 0);
        assert!(info.exhausted());
    }

    #[test]
    fn zero_on_either_axis_means_exhausted() {
        let h = headers(&[
            ("X-Ratelimit-Remaining-Tokens", "100"),
            ("X-Ratelimit-Remaining-Requests", "0"),
        ]);
        assert!(RateLimitInfo::from_headers(&h).exhausted());
    }

    #[test]
    fn backoff_takes_the_larger_reset_and_defaults_to_59() {
        let h = headers(&[
            ("X-Ratelimit-Reset-Tokens", "10"),
            ("X-Ratelimit-Reset-Requests", "30"),
        ]);
        assert_eq!(RateLimitInfo::from_headers(&h).backoff_secs(), 30);

        assert_eq!(RateLimitInfo::from_headers(&HeaderMap::new()).backoff_secs(), 59);
    }
}
