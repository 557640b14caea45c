//! 后台刷新任务：每秒检查一次容量记录，把到期的恢复到配置上限。
//!
//! 该任务不观察上游，只是兜底机制：即使完全没有流量，预算也不会永远停在耗尽状态。

use crate::endpoint_pool::EndpointPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 启动刷新 ticker。收到关闭信号后在下一个 tick 边界退出。
pub fn spawn_refresh_task(
    pool: Arc<EndpointPool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("容量刷新任务启动");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => pool.refresh_expired().await,
                _ = shutdown.changed() => {
                    tracing::info!("容量刷新任务收到退出信号，停止");
                    return;
                }
            }
        }
    })
}
