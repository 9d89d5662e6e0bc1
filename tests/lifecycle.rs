//! Connection lifecycle through the public client and server API

use rstest::rstest;
use shm_compute::{Client, Config, ErrorKind, Response, Server, ShmError};
use shm_compute_shared_memory::{BlockStore, ConnectionQueue, Stage};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn config(dir: &TempDir, name: &str) -> Config {
    Config {
        store_root: dir.path().to_path_buf(),
        queue_name: name.to_string(),
        queue_capacity: 4,
        max_workers: 4,
        poll_interval_ms: 1,
        idle_timeout_ms: 200,
        response_timeout_ms: 5_000,
        ..Config::default()
    }
}

fn start(config: &Config) -> (watch::Sender<bool>, tokio::task::JoinHandle<shm_compute_shared_memory::Result<shm_compute::StatsSnapshot>>) {
    let server = Server::new(config.clone()).unwrap();
    let (tx, rx) = watch::channel(false);
    (tx, tokio::spawn(server.run(rx)))
}

#[rstest]
#[case::add(b'+', 10, 5, Response::success(15))]
#[case::subtract(b'-', 10, 15, Response::success(-5))]
#[case::multiply(b'*', -4, 6, Response::success(-24))]
#[case::divide(b'/', 9, 2, Response::success(4))]
#[case::divide_by_zero(b'/', 1, 0, Response::unsupported())]
#[case::unknown_operator(b'%', 9, 2, Response::unsupported())]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn arithmetic_round_trip(#[case] op: u8, #[case] n1: i64, #[case] n2: i64, #[case] expected: Response) {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "arith");
    let (tx, running) = start(&config);

    let response = tokio::task::spawn_blocking(move || {
        let client = Client::connect(&config, None).unwrap();
        let response = client.arithmetic(op, n1, n2).unwrap();
        client.unregister().unwrap();
        response
    })
    .await
    .unwrap();
    assert_eq!(response, expected);

    tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_after_unregister_are_rejected() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "unregister");
    let (tx, running) = start(&config);

    let cfg = config.clone();
    tokio::task::spawn_blocking(move || {
        let store = BlockStore::new(&cfg.store_root).unwrap();
        let queue = ConnectionQueue::open(&store, &cfg.queue_name, cfg.wait_options()).unwrap();
        let channel = queue.post("leaver").unwrap();

        assert_eq!(
            channel.call(shm_compute::Request::even_or_odd(4), cfg.response_timeout()).unwrap(),
            Response::success(0)
        );
        channel.call(shm_compute::Request::unregister(), cfg.response_timeout()).unwrap();
        assert_eq!(channel.stage().unwrap(), Stage::Closed);

        let err = channel.submit(shm_compute::Request::is_prime(7)).unwrap_err();
        assert!(matches!(err, ShmError::Protocol(_)));
    })
    .await
    .unwrap();

    tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "abandon");
    let (tx, running) = start(&config);

    let cfg = config.clone();
    let (id, stage) = tokio::task::spawn_blocking(move || {
        let client = Client::connect(&cfg, Some("sleeper")).unwrap();
        std::thread::sleep(Duration::from_millis(600));
        let store = BlockStore::new(&cfg.store_root).unwrap();
        (client.channel_id(), store.exists(client.channel_id()))
    })
    .await
    .unwrap();
    assert!(!stage, "channel {} should have been unlinked", id);

    tx.send(true).unwrap();
    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.abandoned, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_channel_reports_protocol_error_to_waiting_client() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "abandon_then_call");
    let (tx, running) = start(&config);

    let cfg = config.clone();
    let err = tokio::task::spawn_blocking(move || {
        let client = Client::connect(&cfg, Some("late")).unwrap();
        std::thread::sleep(Duration::from_millis(600));
        client.is_prime(11).unwrap_err()
    })
    .await
    .unwrap();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    tx.send(true).unwrap();
    running.await.unwrap().unwrap();
}

#[test]
fn full_queue_rejects_new_clients() {
    let dir = TempDir::new().unwrap();
    let config = Config { connect_retries: 0, ..config(&dir, "full") };
    let store = BlockStore::new(&config.store_root).unwrap();
    let queue = ConnectionQueue::create(&store, &config.queue_name, 2, config.wait_options()).unwrap();

    let _a = Client::connect(&config, Some("a")).unwrap();
    let _b = Client::connect(&config, Some("b")).unwrap();
    let before = store.list().unwrap();

    let err = Client::connect(&config, Some("c")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert_eq!(queue.len().unwrap(), 2);
    assert_eq!(store.list().unwrap().len(), before.len());
}

#[test]
fn queue_is_first_in_first_out() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "fifo");
    let store = BlockStore::new(&config.store_root).unwrap();
    let queue = ConnectionQueue::create(&store, &config.queue_name, 4, config.wait_options()).unwrap();

    let ids: Vec<_> = ["first", "second", "third"]
        .iter()
        .map(|owner| Client::connect(&config, Some(owner)).unwrap().channel_id())
        .collect();

    for id in ids {
        let channel = queue.dequeue().unwrap();
        assert_eq!(channel.id(), id);
        assert_eq!(channel.stage().unwrap(), Stage::Init);
    }
    assert!(matches!(queue.dequeue(), Err(ShmError::Empty)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_reclaims_everything() {
    let dir = TempDir::new().unwrap();
    let config = Config { max_workers: 1, ..config(&dir, "shutdown") };
    let (tx, running) = start(&config);

    let cfg = config.clone();
    let clients = tokio::task::spawn_blocking(move || {
        (0..3).map(|i| Client::connect(&cfg, Some(&format!("idle-{}", i))).unwrap()).collect::<Vec<_>>()
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    running.await.unwrap().unwrap();

    let store = BlockStore::new(&config.store_root).unwrap();
    assert!(store.list().unwrap().is_empty());
    drop(clients);
}
