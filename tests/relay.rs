//! The relay served over a real socket, with log channels as clients

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_test::assert_ok;

use landfall_sync::app::AppState;
use landfall_sync::config::RelayConfig;
use landfall_sync::http::auth::sign_session_token;
use landfall_sync::http::build_router;
use landfall_sync::protocol::{Envelope, RecordKind};
use landfall_sync::transport::{InboundQueue, LogEndpoint, Transport, WsChannel};

const SECRET: &str = "relay-test-secret";

async fn serve() -> String {
    serve_with_grace(Duration::from_secs(60)).await.0
}

async fn serve_with_grace(session_grace: Duration) -> (String, AppState) {
    let state = AppState::new(RelayConfig {
        server_addr: "127.0.0.1:0".parse().unwrap(),
        log_level: "info".into(),
        log_json: false,
        relay_secret: SECRET.into(),
        log_dir: None,
        max_records: 100,
        session_grace,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("ws://{}", addr), state)
}

fn join(base_url: &str, player: &str) -> WsChannel {
    WsChannel::connect_log(
        LogEndpoint {
            base_url: base_url.into(),
            session_id: "room".into(),
            player_id: player.into(),
            token: sign_session_token(SECRET, "room", player).unwrap(),
        },
        64,
    )
}

/// Next record of `kind`, skipping everything else
async fn next_of(queue: &mut InboundQueue, kind: RecordKind) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let bytes = queue.recv().await.expect("log channel closed");
            let envelope = Envelope::decode(&bytes).unwrap();
            if envelope.kind == kind {
                return envelope;
            }
        }
    })
    .await
    .expect("no record arrived")
}

#[tokio::test]
async fn relay_stamps_and_fans_out_records() {
    let base_url = serve().await;
    let blue = join(&base_url, "blue");
    let red = join(&base_url, "red");
    let mut red_inbound = red.take_receiver().unwrap();

    // blue's send claims another sender; the relay overwrites it
    let mut record = Envelope::bare(RecordKind::Snapshot, "mallory");
    record.sequence = Some(999);
    assert_ok!(blue.send(record.encode().unwrap()));

    let delivered = next_of(&mut red_inbound, RecordKind::Snapshot).await;
    assert_eq!(delivered.sender_id, "blue");
    assert!(delivered.server_timestamp.is_some());
    let sequence = delivered.sequence.unwrap();
    assert!(sequence >= 1 && sequence < 999);
}

#[tokio::test]
async fn late_joiner_replays_the_log() {
    let base_url = serve().await;
    let blue = join(&base_url, "blue");
    let mut blue_inbound = blue.take_receiver().unwrap();
    // blue's own join shows up once it is live
    next_of(&mut blue_inbound, RecordKind::Join).await;

    assert_ok!(blue.send(Envelope::bare(RecordKind::Snapshot, "blue").encode().unwrap()));
    next_of(&mut blue_inbound, RecordKind::Snapshot).await;

    let red = join(&base_url, "red");
    let mut red_inbound = red.take_receiver().unwrap();
    let replayed = next_of(&mut red_inbound, RecordKind::Snapshot).await;
    assert_eq!(replayed.sender_id, "blue");
}

#[tokio::test]
async fn burst_above_the_rate_limit_is_delivered_in_full() {
    let base_url = serve().await;
    let blue = join(&base_url, "blue");
    let red = join(&base_url, "red");
    let mut red_inbound = red.take_receiver().unwrap();

    for n in 0..40u64 {
        let record =
            Envelope::new(RecordKind::Command, "blue", &serde_json::json!({ "n": n })).unwrap();
        assert_ok!(blue.send(record.encode().unwrap()));
    }

    let mut seen = Vec::new();
    while seen.len() < 40 {
        let record = next_of(&mut red_inbound, RecordKind::Command).await;
        seen.push(record.payload["n"].as_u64().unwrap());
    }
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn abandoned_session_is_evicted_after_grace() {
    let (base_url, state) = serve_with_grace(Duration::from_millis(50)).await;
    let blue = join(&base_url, "blue");
    let mut blue_inbound = blue.take_receiver().unwrap();
    next_of(&mut blue_inbound, RecordKind::Join).await;
    assert_eq!(state.sessions.len(), 1);

    blue.close();
    for _ in 0..300 {
        if state.sessions.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session log was never evicted");
}

#[tokio::test]
async fn bad_token_is_refused() {
    let base_url = serve().await;
    let url = format!("{}/sessions/room/ws?player=blue&token=forged", base_url);

    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected an HTTP refusal, got {:?}", other.map(|_| ())),
    }
}
