//! Server and clients living in different OS processes

use rstest::rstest;
use shm_compute::{Config, Request, Server, StatsSnapshot};
use shm_compute_shared_memory::{BlockId, BlockStore, ChannelRecord, ConnectionQueue, WaitOptions};
use std::io::{BufRead, BufReader};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

const STORE_ROOT_ENV: &str = "SHM_COMPUTE_TEST_STORE_ROOT";
const QUEUE_NAME_ENV: &str = "SHM_COMPUTE_TEST_QUEUE_NAME";

fn config(dir: &TempDir, name: &str) -> Config {
    Config {
        store_root: dir.path().join("store"),
        queue_name: name.to_string(),
        queue_capacity: 4,
        max_workers: 4,
        poll_interval_ms: 1,
        idle_timeout_ms: 300,
        response_timeout_ms: 5_000,
        lock_timeout_ms: 2_000,
        ..Config::default()
    }
}

async fn wait_for(what: &str, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn stop(
    tx: watch::Sender<bool>,
    running: tokio::task::JoinHandle<shm_compute_shared_memory::Result<StatsSnapshot>>,
) -> StatsSnapshot {
    tx.send(true).unwrap();
    running.await.unwrap().unwrap()
}

#[rstest]
#[case::divide(&["arith", "/", "10", "3"], "3")]
#[case::composite(&["prime", "4"], "0")]
#[case::divide_by_zero(&["arith", "/", "5", "0"], "unsupported")]
#[case::negative_odd(&["even-odd", "-7"], "1")]
#[case::negative_prime(&["prime", "-1"], "failure")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn call_binary_talks_to_server(#[case] operation: &[&str], #[case] expected: &str) {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "xproc_call");
    let path = dir.path().join("shm-compute.toml");
    config.save_to_file(&path).unwrap();

    let server = Server::new(config.clone()).unwrap();
    let store = server.store().clone();
    let stats = server.stats();
    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn(server.run(rx));

    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_shm-compute"))
        .arg("--config")
        .arg(&path)
        .args(["call", "--name", "remote"])
        .args(operation)
        .output()
        .await
        .unwrap();
    assert!(output.status.success(), "call failed: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), expected);

    // Only the queue itself should remain once the worker has cleaned up.
    let queue_id = BlockStore::block_id_for(&config.queue_name);
    wait_for("channel release", || store.list().unwrap() == vec![queue_id]).await;
    wait_for("worker exit", || stats.snapshot().unregistered == 1).await;

    let final_stats = stop(tx, running).await;
    assert_eq!(final_stats.accepted, 1);
    assert_eq!(final_stats.requests_served, 1);
    assert!(store.list().unwrap().is_empty());
}

/// Runs only as a child of `worker_recovers_lock_from_killed_client`: posts a
/// channel, submits a request, then takes the channel lock and never lets go.
#[test]
fn holds_channel_lock_until_killed() {
    let (Ok(root), Ok(queue_name)) = (std::env::var(STORE_ROOT_ENV), std::env::var(QUEUE_NAME_ENV)) else {
        return;
    };

    let store = BlockStore::new(root).unwrap();
    let queue = ConnectionQueue::open(&store, &queue_name, WaitOptions::default()).unwrap();
    let channel = queue.post("doomed").unwrap();
    channel.submit(Request::is_prime(7)).unwrap();

    let block = store.attach_by_id(channel.id()).unwrap();
    let guard = block.view::<ChannelRecord>().unwrap().lock().try_acquire().unwrap();
    std::mem::forget(guard);

    println!("locked {}", channel.id().0);
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_recovers_lock_from_killed_client() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "xproc_lock");

    // The queue exists before the child posts, but nothing serves it yet.
    let server = Server::new(config.clone()).unwrap();
    let store = server.store().clone();

    let mut child = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "holds_channel_lock_until_killed", "--nocapture", "--test-threads=1", "--quiet"])
        .env(STORE_ROOT_ENV, &config.store_root)
        .env(QUEUE_NAME_ENV, &config.queue_name)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let child_pid = child.id();

    let stdout = child.stdout.take().unwrap();
    let channel_id = BufReader::new(stdout)
        .lines()
        .map(|line| line.unwrap())
        .find_map(|line| line.strip_prefix("locked ").map(|id| BlockId(id.parse().unwrap())))
        .expect("child never reported its channel");

    child.kill().unwrap();
    child.wait().unwrap();

    let block = store.attach_by_id(channel_id).unwrap();
    let record = block.view::<ChannelRecord>().unwrap();
    assert_eq!(record.lock().holder_pid(), Some(child_pid));

    let stats = server.stats();
    let (tx, rx) = watch::channel(false);
    let running = tokio::spawn(server.run(rx));

    // The worker has to take the lock over to answer, then reclaims the
    // channel once the dead client stays silent.
    wait_for("abandoned channel", || stats.snapshot().abandoned == 1).await;
    let final_stats = stop(tx, running).await;

    assert_eq!(final_stats.accepted, 1);
    assert_eq!(final_stats.requests_served, 1);
    assert_eq!(final_stats.abandoned, 1);
    assert!(!store.exists(channel_id));
    assert_ne!(record.lock().holder_pid(), Some(child_pid));
}
