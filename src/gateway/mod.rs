//! 反向代理网关：认证、模型识别、端点选择与带重试的上游转发。

mod auth;
mod handler;
mod upstream;

pub use handler::{handle_healthz, handle_proxy};

use crate::config::Config;
use crate::endpoint_pool::EndpointPool;
use regex::Regex;
use std::sync::Arc;

/// 所有请求处理器共享的转发状态。
pub struct GatewayState {
    pub cfg: Config,
    pub pool: Arc<EndpointPool>,
    upstream: upstream::UpstreamClient,
    /// Azure 形式的部署路径；对所有端点统一应用。
    deployment_pattern: Regex,
}

impl GatewayState {
    pub fn new(cfg: Config, pool: Arc<EndpointPool>) -> anyhow::Result<Self> {
        let upstream = upstream::UpstreamClient::new(&cfg)?;
        let deployment_pattern = Regex::new(r"/openai/deployments/(.+?)/")?;
        Ok(Self {
            cfg,
            pool,
            upstream,
            deployment_pattern,
        })
    }
}
