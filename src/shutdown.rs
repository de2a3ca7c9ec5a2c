// 停机协调：信号到取消令牌的桥接，接入循环与后台任务共用。
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returns a token that cancels once SIGINT or SIGTERM arrives. The accept
/// loop stops taking connections on cancellation and the retention worker
/// winds down its purge loop; in-flight requests drain under the deadline
/// enforced by the caller.
pub fn watch_signals() -> CancellationToken {
    let token = CancellationToken::new();
    let root = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested, draining");
        root.cancel();
    });
    token
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                // Containers send SIGTERM; without the handler only ctrl-c
                // can stop the process.
                warn!("sigterm handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
