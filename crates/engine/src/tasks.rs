use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{Engine, EngineError};

/// Periodic health refresh, consistency sweep and retention cleanup.
///
/// Each pass runs on the blocking pool. Cancelling never interrupts a pass
/// half way; the engine's shared state is only ever replaced whole.
pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Must be called from within a tokio runtime.
    pub fn spawn(engine: Arc<Engine>) -> Self {
        let token = CancellationToken::new();
        let config = engine.config().clone();

        let health_period = non_zero(config.health.interval());
        let sweep_period = non_zero(Duration::from_secs(config.monitor.interval_secs));
        let retention_period = non_zero(Duration::from_secs(config.sessions.cleanup_interval_secs));

        let handles = vec![
            tokio::spawn(periodic("health", health_period, token.clone(), Arc::clone(&engine), |engine| {
                engine.refresh_health();
                Ok(())
            })),
            tokio::spawn(periodic("consistency", sweep_period, token.clone(), Arc::clone(&engine), |engine| {
                engine.consistency_report().map(|_| ())
            })),
            tokio::spawn(periodic("retention", retention_period, token.clone(), engine, |engine| {
                engine.expire_idle_sessions()?;
                engine.cleanup_old_data(engine.config().sessions.retention_days)?;
                Ok(())
            })),
        ];

        Self { token, handles }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop all loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background task ended abnormally");
            }
        }
    }
}

fn non_zero(period: Duration) -> Duration {
    period.max(Duration::from_millis(10))
}

type PassResult = Result<Result<(), EngineError>, JoinError>;

async fn periodic<F>(name: &'static str, period: Duration, token: CancellationToken, engine: Arc<Engine>, work: F)
where
    F: Fn(&Engine) -> Result<(), EngineError> + Send + Sync + Copy + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // a pass that outlived its interval; blocking work cannot be aborted
    let mut overrun: Option<JoinHandle<Result<(), EngineError>>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(previous) = overrun.take() {
            if !previous.is_finished() {
                debug!(task = name, "previous pass still running, tick skipped");
                overrun = Some(previous);
                continue;
            }
            report(name, previous.await);
        }

        let engine = Arc::clone(&engine);
        let mut pass = tokio::task::spawn_blocking(move || work(engine.as_ref()));

        tokio::select! {
            _ = token.cancelled() => break,
            finished = timeout(period, &mut pass) => match finished {
                Ok(joined) => report(name, joined),
                Err(_) => {
                    warn!(task = name, "background pass overran its interval");
                    overrun = Some(pass);
                }
            },
        }
    }
    debug!(task = name, "background task stopped");
}

fn report(name: &str, joined: PassResult) {
    match joined {
        Ok(Ok(())) => debug!(task = name, "background pass done"),
        Ok(Err(e)) => error!(task = name, error = %e, "background pass failed"),
        Err(e) => error!(task = name, error = %e, "background pass panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use labelsync_storage::SqliteReplica;

    use crate::{EngineConfig, InMemoryMetrics, ReplicaEntry, ReplicaRegistry, ReplicaRole};

    static ACTIVE: AtomicUsize = AtomicUsize::new(0);
    static PEAK: AtomicUsize = AtomicUsize::new(0);
    static PASSES: AtomicUsize = AtomicUsize::new(0);

    fn engine() -> Arc<Engine> {
        let registry = ReplicaRegistry::new(vec![ReplicaEntry::new(
            "primary",
            ReplicaRole::Primary,
            Arc::new(SqliteReplica::open_in_memory().unwrap()),
        )])
        .unwrap();
        Arc::new(Engine::with_registry(
            EngineConfig::default(),
            registry,
            Arc::new(InMemoryMetrics::default()),
        ))
    }

    fn slow_pass(_: &Engine) -> Result<(), EngineError> {
        let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
        PEAK.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));
        ACTIVE.fetch_sub(1, Ordering::SeqCst);
        PASSES.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overrunning_passes_never_overlap() {
        let token = CancellationToken::new();
        let handle = tokio::spawn(periodic(
            "slow",
            Duration::from_millis(10),
            token.clone(),
            engine(),
            slow_pass,
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        token.cancel();
        handle.await.unwrap();
        // let a pass that was running at cancellation finish
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(PEAK.load(Ordering::SeqCst), 1);
        assert!(PASSES.load(Ordering::SeqCst) >= 2);
    }
}
