use std::{sync::Arc, time::Duration};

use broker::{Broker, BrokerConfig, GridStore, HttpWorker, MemoryStore, TurnExecutor};
use controller::BrokerClient;
use engine::{patterns, reference};
use shared::{
    domain::Grid,
    error::{ApiException, ErrorCode},
    protocol::{BrokerEvent, ControlKind, RunState, StartRequest},
};
use tokio::net::TcpListener;

async fn serve(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn field() -> Grid {
    let mut grid = Grid::new(16, 16).expect("grid");
    patterns::place(&mut grid, patterns::GLIDER, 1, 1);
    patterns::place(&mut grid, patterns::BLINKER, 9, 9);
    grid
}

async fn cluster(workers: usize) -> (BrokerClient, Arc<MemoryStore>) {
    let mut executors: Vec<Arc<dyn TurnExecutor>> = Vec::new();
    for _ in 0..workers {
        let url = serve(worker::build_router(worker::DEFAULT_MAX_BODY_BYTES)).await;
        executors.push(Arc::new(HttpWorker::new(url)));
    }
    let store = Arc::new(MemoryStore::new());
    store.insert("field", field()).await;
    let broker = Arc::new(Broker::new(
        executors,
        Arc::clone(&store) as Arc<dyn GridStore>,
        BrokerConfig::default(),
    ));
    let url = serve(broker::build_router(broker, broker::DEFAULT_MAX_BODY_BYTES)).await;
    (BrokerClient::new(&url).expect("client"), store)
}

fn request(turns: u64) -> StartRequest {
    StartRequest {
        image_name: "field".into(),
        turns,
        threads: 4,
    }
}

#[tokio::test]
async fn controller_runs_game_and_follows_events() {
    let (client, store) = cluster(2).await;
    client.ping().await.expect("ping");
    assert!(!client.status().await.expect("status").running);

    let mut events = client.subscribe_events().await.expect("events");
    let response = client.start_game(&request(16)).await.expect("start");
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.turns_completed, 16);

    let expected = reference::simulate(&field(), 16);
    assert_eq!(response.summary.expect("summary"), expected.summary());
    assert_eq!(store.get("16x16x16").await, Some(expected));

    let final_turn = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.next().await {
                Some(BrokerEvent::FinalTurnComplete { turn, .. }) => break turn,
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    })
    .await
    .expect("final event");
    assert_eq!(final_turn, 16);
}

#[tokio::test]
async fn controller_pauses_and_quits_a_long_run() {
    let (client, _) = cluster(2).await;
    let client = Arc::new(client);

    let runner = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.start_game(&request(10_000_000)).await })
    };
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = client.status().await.expect("status");
            if status.running && status.turn > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run never progressed");

    let paused = client.control(ControlKind::Pause).await.expect("pause");
    assert_eq!(paused.state, RunState::Paused);
    let saved = client.control(ControlKind::Save).await.expect("save");
    assert_eq!(saved.saved_as, Some(format!("16x16x{}", paused.turn)));

    let quit = client.control(ControlKind::Quit).await.expect("quit");
    let response = runner.await.expect("join").expect("start");
    assert!(response.success);
    assert!(response.quit_early);
    assert_eq!(response.turns_completed, quit.turn);
    assert_eq!(
        response.summary.expect("summary"),
        reference::simulate(&field(), quit.turn).summary()
    );
}

#[tokio::test]
async fn broker_errors_surface_as_api_exceptions() {
    let (client, _) = cluster(1).await;

    let err = client
        .control(ControlKind::Resume)
        .await
        .expect_err("no run");
    let api = err.downcast_ref::<ApiException>().expect("api error");
    assert_eq!(api.code, ErrorCode::Conflict);

    let mut missing = request(1);
    missing.image_name = "nowhere".into();
    let err = client.start_game(&missing).await.expect_err("missing image");
    let api = err.downcast_ref::<ApiException>().expect("api error");
    assert_eq!(api.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn unreachable_broker_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = BrokerClient::new(&format!("http://{addr}")).expect("client");
    assert!(client.start_game(&request(1)).await.is_err());
}
