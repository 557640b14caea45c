mod config;
mod endpoint_pool;
mod error;
mod gateway;
mod logging;

use anyhow::Context;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 配置校验失败直接以非零码退出。
    let cfg = config::Config::load().context("加载配置失败")?;

    init_tracing();

    let pool = Arc::new(endpoint_pool::EndpointPool::new(&cfg)?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let refresher = endpoint_pool::spawn_refresh_task(pool.clone(), shutdown_rx);

    let body_limit = cfg.body_limit;
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("监听地址无效")?;

    let state = Arc::new(gateway::GatewayState::new(cfg, pool)?);
    let app = Router::new()
        .route("/healthz", get(gateway::handle_healthz))
        .fallback(gateway::handle_proxy)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    tracing::info!("Server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    // 通知刷新任务退出，并等待其在下一个 tick 边界落地。
    let _ = shutdown_tx.send(true);
    let _ = refresher.await;

    Ok(())
}

fn init_tracing() {
    // 依赖库日志压到 warn 避免噪声，自身至少保留 info。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,llmgate=info")
    } else if env.contains("llmgate") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},llmgate=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
