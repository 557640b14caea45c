use crate::error::AppError;
use axum::http::HeaderValue;
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_TOKEN_CUTOFF: i64 = 500;
const DEFAULT_RETRY_COUNT: usize = 3;
const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// 校验后的进程配置。
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 上游端到端超时（秒）。
    pub timeout_secs: u64,
    /// 端点可被选中所需的最低 token 保留量。
    pub token_cutoff: i64,
    /// 入口认证用的共享密钥。
    pub auth_key: String,
    /// 单个请求最多尝试的上游转发次数。
    pub retry_count: usize,
    /// 缓冲客户端请求体的大小上限（字节），超出回复 413。
    pub body_limit: usize,
    pub endpoints: Vec<EndpointItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointItem {
    pub url: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    #[serde(default)]
    pub models: Vec<ModelItem>,
}

/// 上游提供方形态：直连 API 或 Azure 式部署 API。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    OpenAI,
    Azure,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Azure => "azure",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelItem {
    pub name: String,
    pub capacity_token: i64,
    pub capacity_request: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    reverse_proxy: RawReverseProxy,
    #[serde(default)]
    endpoints: Vec<EndpointItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReverseProxy {
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<u64>,
    token_cutoff: Option<i64>,
    auth_key: Option<String>,
    retry_count: Option<usize>,
    body_limit: Option<usize>,
}

impl Config {
    /// 读取 `config.yaml`（当前目录优先，其次 /etc/llmgate/），
    /// 再叠加 `LLMGATE_*` 环境变量（嵌套键用 `__` 分隔，
    /// 例如 `LLMGATE_REVERSEPROXY__PORT=9000`）。
    pub fn load() -> Result<Self, AppError> {
        let figment = Figment::new()
            .merge(Yaml::file("/etc/llmgate/config.yaml"))
            .merge(Yaml::file("config.yaml"))
            .merge(Env::prefixed("LLMGATE_").split("__"));
        Self::from_figment(figment)
    }

    fn from_figment(figment: Figment) -> Result<Self, AppError> {
        let raw: RawConfig = figment
            .extract()
            .map_err(|e| AppError::config(format!("解析配置失败: {e}")))?;

        let rp = raw.reverse_proxy;
        let cfg = Self {
            host: rp.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: rp.port.unwrap_or(DEFAULT_PORT),
            timeout_secs: rp.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            token_cutoff: rp.token_cutoff.unwrap_or(DEFAULT_TOKEN_CUTOFF),
            auth_key: rp.auth_key.unwrap_or_default(),
            retry_count: rp.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            body_limit: rp.body_limit.unwrap_or(DEFAULT_BODY_LIMIT),
            endpoints: raw.endpoints,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.port == 0 {
            return Err(AppError::config("端口号必须在 1..=65535 之间"));
        }
        if self.timeout_secs < 1 {
            return Err(AppError::config("timeout 必须不小于 1 秒"));
        }
        if self.token_cutoff < 1 {
            return Err(AppError::config("tokenCutoff 必须不小于 1"));
        }
        if self.auth_key.is_empty() {
            return Err(AppError::config("authKey 不能为空"));
        }
        if self.retry_count < 1 {
            return Err(AppError::config("retryCount 必须不小于 1"));
        }
        if self.endpoints.is_empty() {
            return Err(AppError::config("至少需要配置一个端点"));
        }

        // 所有端点必须暴露完全一致的模型集合（名称与数量都相同）。
        let mut known_models: HashSet<String> = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            Url::parse(&endpoint.url)
                .map_err(|e| AppError::config(format!("端点 URL 无效 `{}`: {e}", endpoint.url)))?;
            if HeaderValue::from_str(&endpoint.key).is_err() {
                return Err(AppError::config(format!(
                    "端点 `{}` 的凭证包含非法字符，无法写入请求头",
                    endpoint.url
                )));
            }
            if endpoint.models.is_empty() {
                return Err(AppError::config(format!(
                    "端点 `{}` 未配置任何模型",
                    endpoint.url
                )));
            }

            if i == 0 {
                for model in &endpoint.models {
                    known_models.insert(model.name.to_lowercase());
                }
                if known_models.len() != endpoint.models.len() {
                    return Err(AppError::config("端点的模型列表存在重复名称"));
                }
            } else {
                if endpoint.models.len() != self.endpoints[0].models.len() {
                    return Err(AppError::config(format!(
                        "端点 `{}` 的模型数量与其他端点不一致",
                        endpoint.url
                    )));
                }
                for model in &endpoint.models {
                    if !known_models.contains(&model.name.to_lowercase()) {
                        return Err(AppError::config(format!(
                            "模型 `{}` 没有在所有端点上配置",
                            model.name
                        )));
                    }
                }
            }

            for model in &endpoint.models {
                if model.capacity_token < 1 {
                    return Err(AppError::config(format!(
                        "模型 `{}` 的 capacityToken 必须不小于 1",
                        model.name
                    )));
                }
                if model.capacity_request < 1 {
                    return Err(AppError::config(format!(
                        "模型 `{}` 的 capacityRequest 必须不小于 1",
                        model.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, AppError> {
        Config::from_figment(Figment::from(Yaml::string(yaml)))
    }

    const VALID: &str = r#"
reverseProxy:
  port: 8000
  timeout: 30
  tokenCutoff: 200
  authKey: s3cret
endpoints:
  - url: https://east.example.com
    key: key-a
    type: azure
    models:
      - name: GPT-X
        capacityToken: 10000
        capacityRequest: 100
  - url: https://west.example.com
    key: key-b
    type: openai
    models:
      - name: gpt-x
        capacityToken: 8000
        capacityRequest: 80
"#;

    #[test]
    fn valid_config_parses_with_defaults() {
        let cfg = parse(VALID).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.token_cutoff, 200);
        assert_eq!(cfg.retry_count, DEFAULT_RETRY_COUNT);
        assert_eq!(cfg.body_limit, DEFAULT_BODY_LIMIT);
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoints[0].kind, EndpointKind::Azure);
        assert_eq!(cfg.endpoints[1].kind, EndpointKind::OpenAI);
    }

    #[test]
    fn missing_auth_key_is_rejected() {
        let yaml = VALID.replace("authKey: s3cret", "");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let yaml = VALID.replace("port: 8000", "port: 0");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn unknown_endpoint_kind_is_rejected() {
        let yaml = VALID.replace("type: openai", "type: bedrock");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn unparseable_url_is_rejected() {
        let yaml = VALID.replace("https://west.example.com", "not a url");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn mismatched_model_sets_are_rejected() {
        let yaml = VALID.replace("name: gpt-x", "name: gpt-y");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn model_names_compare_case_insensitively() {
        // 第一个端点写 GPT-X，第二个写 gpt-x，应视为同一个模型。
        assert!(parse(VALID).is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let yaml = VALID.replace("capacityRequest: 80", "capacityRequest: 0");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn no_endpoints_is_rejected() {
        let yaml = r#"
reverseProxy:
  authKey: s3cret
"#;
        assert!(parse(yaml).is_err());
    }
}
