use crate::config::Config;
use crate::endpoint_pool::selector;
use crate::endpoint_pool::types::{Endpoint, EndpointChoice, ModelCapacity};
use crate::error::AppError;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// 刷新窗口：预算恢复后，下一次兜底刷新在 60 秒之后。
const REFRESH_WINDOW_SECS: i64 = 60;

/// 端点容量池：集中维护所有端点的容量记录与轮询游标。
///
/// 全部可变状态由单把互斥锁保护；模型名集合初始化后只读，无锁访问。
#[derive(Debug)]
pub struct EndpointPool {
    token_cutoff: i64,
    model_names: HashSet<String>,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    next_endpoint: usize,
    endpoints: Vec<Endpoint>,
}

impl EndpointPool {
    /// 从校验过的配置构建容量池。
    ///
    /// 所有记录从零预算、刷新时刻为当前时间起步，由首次刷新提升到配置上限。
    pub fn new(cfg: &Config) -> Result<Self, AppError> {
        let now = Utc::now();
        let mut model_names = HashSet::new();
        let mut endpoints = Vec::with_capacity(cfg.endpoints.len());

        for (index, item) in cfg.endpoints.iter().enumerate() {
            let url = Url::parse(&item.url)
                .map_err(|e| AppError::config(format!("端点 URL 无效 `{}`: {e}", item.url)))?;
            let connection = super::EndpointConnection {
                id: index as u32 + 1,
                url,
                key: item.key.clone(),
                kind: item.kind,
            };

            let mut models = HashMap::with_capacity(item.models.len());
            for model in &item.models {
                let name = model.name.to_lowercase();
                models.insert(
                    name.clone(),
                    ModelCapacity {
                        capacity_token: model.capacity_token,
                        capacity_request: model.capacity_request,
                        token_available: 0,
                        request_available: 0,
                        next_capacity_refresh: now,
                    },
                );
                model_names.insert(name);
            }

            tracing::info!(
                id = connection.id,
                endpoint = %connection.authority(),
                kind = connection.kind.as_str(),
                models = models.len(),
                "注册上游端点"
            );
            endpoints.push(Endpoint { connection, models });
        }

        Ok(Self {
            token_cutoff: cfg.token_cutoff,
            model_names,
            inner: Mutex::new(Inner {
                next_endpoint: 0,
                endpoints,
            }),
        })
    }

    /// 选择下一个可承载 `model_name` 的端点。
    ///
    /// 从游标起环形扫描；没有端点通过容量校验时返回当前游标端点并标记
    /// `not_available`。无论哪种情况，被返回端点的请求余额都会扣减一次
    /// （到 0 封底），游标移动到被返回端点的下一格。
    pub async fn select_endpoint(&self, model_name: &str) -> EndpointChoice {
        let mut inner = self.inner.lock().await;
        let n = inner.endpoints.len();
        let pick =
            selector::pick_round_robin(&inner.endpoints, inner.next_endpoint, model_name, self.token_cutoff);

        let endpoint = &mut inner.endpoints[pick.index];
        if let Some(m) = endpoint.models.get_mut(model_name) {
            m.request_available = (m.request_available - 1).max(0);
        }
        let connection = endpoint.connection.clone();
        inner.next_endpoint = (pick.index + 1) % n;

        if pick.not_available {
            tracing::warn!(model = model_name, endpoint = %connection.authority(), "没有端点还有容量，退回当前游标端点");
        }

        EndpointChoice {
            not_available: pick.not_available,
            endpoint: connection,
        }
    }

    /// 按上游反馈覆盖预算；下一次兜底刷新推迟到 60 秒后。
    pub async fn report_capacity(
        &self,
        endpoint_id: u32,
        model_name: &str,
        token_available: i64,
        request_available: i64,
    ) {
        let next_refresh = Utc::now() + Duration::seconds(REFRESH_WINDOW_SECS);
        self.overwrite(endpoint_id, model_name, token_available, request_available, next_refresh)
            .await;
    }

    /// 上游报告耗尽时的覆盖：刷新时刻由调用方根据 reset 头推算。
    pub async fn report_exhausted(
        &self,
        endpoint_id: u32,
        model_name: &str,
        token_available: i64,
        request_available: i64,
        next_refresh: DateTime<Utc>,
    ) {
        self.overwrite(endpoint_id, model_name, token_available, request_available, next_refresh)
            .await;
    }

    async fn overwrite(
        &self,
        endpoint_id: u32,
        model_name: &str,
        token_available: i64,
        request_available: i64,
        next_refresh: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        let Some(endpoint) = inner
            .endpoints
            .iter_mut()
            .find(|e| e.connection.id == endpoint_id)
        else {
            tracing::warn!(endpoint_id, "收到未知端点的容量上报，忽略");
            return;
        };
        let Some(m) = endpoint.models.get_mut(model_name) else {
            tracing::warn!(endpoint_id, model = model_name, "收到未知模型的容量上报，忽略");
            return;
        };

        m.token_available = token_available;
        m.request_available = request_available;
        m.next_capacity_refresh = next_refresh;
    }

    /// 模型名是否在配置的集合内（入参应已小写化）。
    pub fn is_valid_model(&self, model_name: &str) -> bool {
        self.model_names.contains(model_name)
    }

    /// 把所有已到刷新时刻的记录恢复到配置上限，由后台 ticker 周期调用。
    pub async fn refresh_expired(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        for endpoint in &mut inner.endpoints {
            let authority = endpoint.connection.authority();
            for (model_name, m) in endpoint.models.iter_mut() {
                if m.next_capacity_refresh < now {
                    tracing::debug!(
                        endpoint = %authority,
                        model = %model_name,
                        token_available = m.token_available,
                        request_available = m.request_available,
                        "恢复容量到配置上限"
                    );
                    m.token_available = m.capacity_token;
                    m.request_available = m.capacity_request;
                    m.next_capacity_refresh = now + Duration::seconds(REFRESH_WINDOW_SECS);
                }
            }
        }
    }

    /// 测试用：读取某条容量记录的 (token, request, next_refresh)。
    #[cfg(test)]
    pub(crate) async fn capacity(
        &self,
        endpoint_id: u32,
        model_name: &str,
    ) -> Option<(i64, i64, DateTime<Utc>)> {
        let inner = self.inner.lock().await;
        let endpoint = inner.endpoints.iter().find(|e| e.connection.id == endpoint_id)?;
        let m = endpoint.models.get(model_name)?;
        Some((m.token_available, m.request_available, m.next_capacity_refresh))
    }
}
