use std::{net::SocketAddr, sync::Arc, time::Duration};

use broker::{
    store::encode_pgm, Broker, BrokerConfig, GridStore, HttpWorker, PgmStore, StartError,
    TurnExecutor,
};
use engine::{patterns, reference};
use shared::{domain::Grid, protocol::StartRequest};
use tokio::{net::TcpListener, task::JoinHandle};

async fn spawn_worker() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("addr");
    let app = worker::build_router(worker::DEFAULT_MAX_BODY_BYTES);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), handle)
}

fn soup() -> Grid {
    let mut grid = Grid::new(32, 24).expect("grid");
    patterns::place(&mut grid, patterns::GLIDER, 3, 3);
    patterns::place(&mut grid, patterns::BLINKER, 20, 5);
    patterns::place(&mut grid, patterns::BLOCK, 10, 18);
    patterns::place(&mut grid, patterns::GLIDER, 28, 20);
    grid
}

async fn broker_for(urls: &[String], dir: &std::path::Path) -> Arc<Broker> {
    let images = dir.join("images");
    tokio::fs::create_dir_all(&images).await.expect("mkdir");
    tokio::fs::write(images.join("soup.pgm"), encode_pgm(&soup()).expect("encode"))
        .await
        .expect("write image");

    let workers = urls
        .iter()
        .map(|url| Arc::new(HttpWorker::new(url.as_str())) as Arc<dyn TurnExecutor>)
        .collect();
    let store = Arc::new(PgmStore::new(images, dir.join("out"))) as Arc<dyn GridStore>;
    let config = BrokerConfig {
        task_timeout: Duration::from_secs(5),
        ..BrokerConfig::default()
    };
    Arc::new(Broker::new(workers, store, config))
}

fn request(turns: u64, threads: usize) -> StartRequest {
    StartRequest {
        image_name: "soup".into(),
        turns,
        threads,
    }
}

#[tokio::test]
async fn workers_over_http_match_reference_and_save_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut urls = Vec::new();
    for _ in 0..3 {
        urls.push(spawn_worker().await.0);
    }
    let broker = broker_for(&urls, dir.path()).await;

    let outcome = broker.start_game(request(30, 6)).await.expect("run");
    assert_eq!(outcome.grid, reference::simulate(&soup(), 30));

    let saved = PgmStore::new(dir.path().join("out"), dir.path().join("out"));
    assert_eq!(saved.load("32x24x30").await.expect("saved grid"), outcome.grid);
}

#[tokio::test]
async fn killed_worker_is_dropped_and_run_still_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (first, _a) = spawn_worker().await;
    let (second, killed) = spawn_worker().await;
    let (third, _c) = spawn_worker().await;
    killed.abort();
    let _ = killed.await;

    let broker = broker_for(&[first, second, third], dir.path()).await;
    let outcome = broker.start_game(request(12, 3)).await.expect("run");
    assert_eq!(outcome.grid, reference::simulate(&soup(), 12));

    let live: Vec<bool> = broker.status().workers.iter().map(|w| w.live).collect();
    assert_eq!(live, vec![true, false, true]);
}

#[tokio::test]
async fn run_fails_when_every_worker_is_gone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (url, handle) = spawn_worker().await;
    handle.abort();
    let _ = handle.await;

    let broker = broker_for(&[url], dir.path()).await;
    match broker.start_game(request(4, 2)).await {
        Err(StartError::Run(err)) => assert_eq!(err.last_committed_turn, 0),
        other => panic!("expected run failure, got {other:?}"),
    }
}
