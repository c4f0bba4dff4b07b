use std::time::Duration;

use labelsync_core::ReplicaId;
use labelsync_engine::{BackgroundTasks, EngineConfig};
use labelsync_harness::{TestCluster, new_label};

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.health.interval_secs = 1;
    config.monitor.interval_secs = 1;
    config.sessions.cleanup_interval_secs = 1;
    config
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_loops_run_and_stop() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::with_config(1, fast_config())?;
    let sid = cluster.engine.create_session("ann-1")?.session_id;
    cluster
        .engine
        .create_label(sid, "ann-1", new_label("d1", "positive", 0.9, &[("n1", 1)]))?;

    let tasks = BackgroundTasks::spawn(cluster.engine.clone());
    let engine = cluster.engine.clone();
    assert!(
        wait_for(|| engine.metrics().gauge("consistency.active_sessions") == Some(1.0)).await,
        "consistency sweep never ran"
    );
    assert!(
        wait_for(|| engine.metrics().counter("cleanup_old_data.success") >= 1).await,
        "retention pass never ran"
    );
    assert!(engine.router().health().snapshot().age().is_some());

    let token = tasks.token();
    tokio::time::timeout(Duration::from_secs(5), tasks.shutdown()).await?;
    assert!(token.is_cancelled());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_loop_notices_an_outage() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::with_config(1, fast_config())?;
    let tasks = BackgroundTasks::spawn(cluster.engine.clone());
    let engine = cluster.engine.clone();
    let replica = ReplicaId::from("replica-1");

    assert!(wait_for(|| engine.router().health().snapshot().age().is_some()).await);
    cluster.set_down("replica-1", true);

    // the next tick is at most one interval away
    let mut noticed = false;
    for _ in 0..40 {
        if !engine.router().health().snapshot().is_healthy(&replica) {
            noticed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(noticed, "health loop did not mark replica-1 down");

    tasks.shutdown().await;
    Ok(())
}
