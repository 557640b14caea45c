use crate::endpoint_pool::EndpointChoice;
use crate::error::AppError;
use crate::gateway::GatewayState;
use crate::gateway::auth;
use crate::gateway::upstream::RateLimitInfo;
use crate::logging;
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) const MSG_BAD_MODEL: &str = "Invalid request. Model unrecognized";
pub(crate) const MSG_BAD_BODY: &str = "Invalid request. Body not readable";

/// 本系统附加到响应上的两个头。
pub(crate) const HEADER_ENDPOINT_URL: &str = "X-Endpoint-Url";
pub(crate) const HEADER_ENDPOINT_NOT_AVAILABLE: &str = "X-Endpoint-Not-Available";

/// `/healthz`：不做认证，直接返回。
pub async fn handle_healthz() -> &'static str {
    "OK"
}

/// 代理入口：认证 → 模型识别 → 缓冲请求体 → 带重试的转发。
pub async fn handle_proxy(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = Uuid::new_v4();
    tracing::info!(id = %request_id, method = %method, path = uri.path(), "收到客户端请求");
    tracing::debug!(id = %request_id, "请求头:\n{}", logging::format_headers(&headers));

    if let Err(e) = auth::authenticate(&headers, &state.cfg.auth_key) {
        tracing::warn!(id = %request_id, "认证失败");
        return e.into_response();
    }

    let Some(model_name) = extract_model(&state, &uri) else {
        tracing::warn!(id = %request_id, path = uri.path(), "无法从路径解析出已知模型");
        return AppError::BadRequest(MSG_BAD_MODEL).into_response();
    };

    // 请求体整体缓冲，重试时原样重放。
    let body = match body {
        Ok(b) => b,
        Err(rejection) => {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                tracing::warn!(id = %request_id, "请求体超过大小上限");
                return rejection.into_response();
            }
            tracing::warn!(id = %request_id, error = %rejection.body_text(), "读取请求体失败");
            return AppError::BadRequest(MSG_BAD_BODY).into_response();
        }
    };

    forward_with_retry(&state, request_id, &model_name, method, &uri, &headers, body).await
}

/// 小写化请求路径后匹配部署模式，并确认模型在配置集合内。
fn extract_model(state: &GatewayState, uri: &Uri) -> Option<String> {
    let path = uri.path().to_lowercase();
    let name = state
        .deployment_pattern
        .captures(&path)?
        .get(1)?
        .as_str()
        .to_string();
    state.pool.is_valid_model(&name).then_some(name)
}

/// 有界重试的转发循环。
///
/// 每次尝试重新向容量池要一个端点，转发后把上游的速率限制头回报给容量池；
/// 2xx 与 400 提交给客户端（400 多为内容过滤，换端点重试没有意义），
/// 其余状态码与传输错误消耗一次尝试。
async fn forward_with_retry(
    state: &GatewayState,
    request_id: Uuid,
    model_name: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    for attempt in 1..=state.cfg.retry_count {
        let choice = state.pool.select_endpoint(model_name).await;
        let endpoint = &choice.endpoint;
        tracing::info!(
            id = %request_id,
            attempt,
            model = model_name,
            endpoint = %endpoint.authority(),
            "转发到上游端点"
        );

        let response = match state
            .upstream
            .forward(endpoint, method.clone(), uri, headers, body.clone())
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(id = %request_id, attempt, error = %e, "上游请求失败，准备重试");
                continue;
            }
        };

        // 上游的速率限制头是预算的权威来源，无论本次结果如何都要回报。
        let limits = RateLimitInfo::from_headers(response.headers());
        if limits.exhausted() {
            let next_refresh = Utc::now() + chrono::Duration::seconds(limits.backoff_secs() + 1);
            tracing::info!(
                id = %request_id,
                endpoint = %endpoint.authority(),
                model = model_name,
                "上游报告 token 或请求额度耗尽"
            );
            state
                .pool
                .report_exhausted(
                    endpoint.id,
                    model_name,
                    limits.remaining_tokens,
                    limits.remaining_requests,
                    next_refresh,
                )
                .await;
        } else {
            state
                .pool
                .report_capacity(
                    endpoint.id,
                    model_name,
                    limits.remaining_tokens,
                    limits.remaining_requests,
                )
                .await;
        }

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            tracing::info!(id = %request_id, "上游返回 400，不再重试");
            return commit_response(response, &choice);
        }
        if !status.is_success() {
            tracing::warn!(id = %request_id, attempt, status = status.as_u16(), "上游返回非 2xx，准备重试");
            continue;
        }
        return commit_response(response, &choice);
    }

    tracing::warn!(
        id = %request_id,
        retries = state.cfg.retry_count,
        "重试次数用尽，回复 429"
    );
    let mut out = StatusCode::TOO_MANY_REQUESTS.into_response();
    out.headers_mut()
        .insert(HEADER_ENDPOINT_NOT_AVAILABLE, HeaderValue::from_static("true"));
    out
}

/// 把上游响应提交给客户端：逐个复制响应头，附加端点标识头，响应体流式透传。
/// 一旦提交就不再失败转移。
fn commit_response(upstream: reqwest::Response, choice: &EndpointChoice) -> Response {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    let mut out = Response::new(Body::from_stream(upstream.bytes_stream()));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in upstream_headers.iter() {
        headers.append(name.clone(), value.clone());
    }
    if let Ok(v) = HeaderValue::from_str(&choice.endpoint.authority()) {
        headers.insert(HEADER_ENDPOINT_URL, v);
    }
    if choice.not_available {
        headers.insert(HEADER_ENDPOINT_NOT_AVAILABLE, HeaderValue::from_static("true"));
    }
    out
}
