//! Restart long-lived tasks that fail or panic

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Restarts allowed inside `window` before the failure bubbles up
    pub max_restarts: usize,
    pub window: Duration,
    /// Pause between a failure and the restart
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            delay: Duration::from_millis(500),
        }
    }
}

/// Run the task built by `factory` until it returns Ok or shutdown fires.
///
/// Every run is spawned so a panic is caught as a failure. A failure past
/// the restart budget is returned to the caller.
pub async fn supervise<F, Fut>(
    name: &str,
    policy: RestartPolicy,
    shutdown: Shutdown,
    mut factory: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        let failure = match tokio::spawn(factory()).await {
            Ok(Ok(())) => {
                info!("Task {} finished", name);
                return Ok(());
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(join) if join.is_panic() => "task panicked".to_string(),
            Err(_) => {
                info!("Task {} was cancelled", name);
                return Ok(());
            }
        };

        if shutdown.is_triggered() {
            warn!("Task {} failed during shutdown: {}", name, failure);
            return Ok(());
        }

        let now = Instant::now();
        while restarts
            .front()
            .is_some_and(|at| now.duration_since(*at) > policy.window)
        {
            restarts.pop_front();
        }
        if restarts.len() >= policy.max_restarts {
            error!(
                "Task {} failed {} times within {:?}, giving up: {}",
                name,
                restarts.len() + 1,
                policy.window,
                failure
            );
            anyhow::bail!("task {name} exceeded its restart budget: {failure}");
        }
        restarts.push_back(now);

        warn!(
            "Task {} failed ({}), restart {}/{}",
            name,
            failure,
            restarts.len(),
            policy.max_restarts
        );
        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
