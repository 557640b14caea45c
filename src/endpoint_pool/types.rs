use crate::config::EndpointKind;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::collections::HashMap;

/// 端点选择结果。
#[derive(Debug, Clone)]
pub struct EndpointChoice {
    /// 为 true 时表示没有任何端点通过容量校验，返回的是当前游标位置的兜底端点。
    pub not_available: bool,
    pub endpoint: EndpointConnection,
}

/// 端点的不可变身份信息。id 从 1 起按配置顺序连续分配。
#[derive(Debug, Clone)]
pub struct EndpointConnection {
    pub id: u32,
    pub url: Url,
    pub key: String,
    pub kind: EndpointKind,
}

impl EndpointConnection {
    /// `host[:port]`，用于日志与 `X-Endpoint-Url` 响应头。
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

/// 每个（端点, 模型）的容量记录。
#[derive(Debug, Clone)]
pub(crate) struct ModelCapacity {
    /// 配置上限（不可变）。
    pub capacity_token: i64,
    pub capacity_request: i64,
    /// 当前预算，由上游反馈覆盖或刷新任务恢复。
    pub token_available: i64,
    pub request_available: i64,
    /// 超过该时刻且没有新的上游反馈时，预算恢复到上限。
    pub next_capacity_refresh: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    pub connection: EndpointConnection,
    /// 键为小写化的模型名。
    pub models: HashMap<String, ModelCapacity>,
}
