use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeDelta;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use wikirace_conn::{
    ClientId, Command, ConnConfig, GameState, IdentityCache, PendingReply, Reply, Request,
    RequestError, ServerConn,
};

fn setup() -> (ServerConn, mpsc::UnboundedReceiver<String>) {
    setup_with(ConnConfig::default())
}

fn setup_with(config: ConnConfig) -> (ServerConn, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ServerConn::new(tx, config).unwrap(), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
        frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
}

fn reply(command: &str, payload: Value) -> String {
    json!({"command": command, "payload": payload, "error_message": ""}).to_string()
}

fn assign_id(conn: &ServerConn, id: &str) {
    conn.handle_message(&json!({"command": "notify_id", "client_id": id, "error_message": ""}).to_string());
}

// --- Request / reply correlation ---

#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let (conn, mut rx) = setup();
    let time = conn.submit(Request::GetTime);
    let page = conn.submit(Request::GetPage {
        page_name: "Rust_(programming_language)".into(),
    });
    let path = conn.submit(Request::GetPath {
        player_id: "p2".into(),
    });
    assert_eq!(conn.pending_count(), 3);

    let commands: Vec<_> = drain(&mut rx)
        .into_iter()
        .map(|frame| frame["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(commands, vec!["get_time", "get_page", "get_path"]);

    // Replies arrive out of order.
    conn.handle_message(&reply("return_path", json!(["Cat", "Dog"])));
    conn.handle_message(&reply("return_time", json!({"time": 42})));
    conn.handle_message(&reply("return_get_page", json!({"html": "<p/>"})));

    assert_eq!(time.await.unwrap().into_payload(), json!({"time": 42}));
    assert_eq!(page.await.unwrap().into_payload(), json!({"html": "<p/>"}));
    assert_eq!(path.await.unwrap().into_payload(), json!(["Cat", "Dog"]));
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn typed_helpers_send_expected_payloads() {
    let (conn, mut rx) = setup();
    let settings = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.get_settings("lobbyA", GameState::Started).await })
    };
    tokio::task::yield_now().await;

    assert_eq!(
        drain(&mut rx),
        vec![json!({"command": "get_settings", "payload": {"lobby_id": "lobbyA", "state": 1}})]
    );
    conn.handle_message(&reply("return_settings", json!({"gameMode": 0})));
    assert_eq!(settings.await.unwrap().unwrap(), json!({"gameMode": 0}));
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_once_and_late_reply_is_ignored() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::GetTime);

    tokio::time::advance(Duration::from_millis(10_001)).await;
    let err = pending.await.unwrap_err();
    assert_eq!(err, RequestError::Timeout { command: "get_time" });
    assert_eq!(err.error_code(), "timeout");
    assert_eq!(conn.pending_count(), 0);

    // No handler left for the late reply; nothing to resolve.
    conn.handle_message(&reply("return_time", json!({"time": 1})));
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn session_creation_gets_extended_timeout() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::StartLobby {
        lobby_id: None,
        arguments: json!({"gameMode": 0, "difficulty": 1}),
    });

    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;
    assert_eq!(conn.pending_count(), 1);

    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(pending.await.unwrap_err().is_timeout());
}

#[tokio::test(start_paused = true)]
async fn reply_cancels_timeout() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::GetTime);
    conn.handle_message(&reply("return_time", json!({"time": 7})));
    assert_eq!(pending.await.unwrap().into_payload(), json!({"time": 7}));

    // A later request on the same key is not hit by the old timer.
    tokio::time::advance(Duration::from_secs(5)).await;
    let second = conn.submit(Request::GetTime);
    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;
    assert_eq!(conn.pending_count(), 1);

    conn.handle_message(&reply("return_time", json!({"time": 8})));
    assert_eq!(second.await.unwrap().into_payload(), json!({"time": 8}));
}

#[tokio::test(start_paused = true)]
async fn newer_request_supersedes_older_on_shared_reply() {
    let (conn, _rx) = setup();
    let forward = conn.submit(Request::GotoPage {
        page_name: "Cat".into(),
        initial: false,
    });
    let back = conn.submit(Request::GoBackPage);
    assert_eq!(conn.pending_count(), 1);

    assert_eq!(
        forward.await.unwrap_err(),
        RequestError::Superseded {
            command: "goto_page"
        }
    );

    conn.handle_message(&reply("return_goto_page", json!({"page": "Start"})));
    assert_eq!(back.await.unwrap().into_payload(), json!({"page": "Start"}));

    // The superseded request's timer never fires.
    tokio::time::advance(Duration::from_secs(30)).await;
    tokio::task::yield_now().await;
    assert_eq!(conn.pending_count(), 0);
}

// --- Requests that borrow a push's name ---

#[tokio::test(start_paused = true)]
async fn push_handler_returns_after_request_times_out() {
    let (conn, _rx) = setup();
    let mut players = conn.register_all_players();
    let pending = conn.submit(Request::GetPlayers {
        lobby_id: String::new(),
    });

    tokio::time::advance(Duration::from_millis(10_001)).await;
    assert!(pending.await.unwrap_err().is_timeout());

    conn.handle_message(&reply("all_players", json!([{"id": "a"}])));
    assert_eq!(players.try_recv(), Some(Ok(json!([{"id": "a"}]))));
}

#[tokio::test]
async fn push_handler_survives_superseded_request() {
    let (conn, _rx) = setup();
    let mut players = conn.register_all_players();
    let first = conn.submit(Request::GetPlayers {
        lobby_id: "lobbyA".into(),
    });
    let second = conn.submit(Request::GetPlayers {
        lobby_id: "lobbyB".into(),
    });
    assert_eq!(
        first.await.unwrap_err(),
        RequestError::Superseded {
            command: "get_players"
        }
    );

    conn.handle_message(&reply("all_players", json!([{"id": "b"}])));
    assert_eq!(second.await.unwrap().into_payload(), json!([{"id": "b"}]));
    assert_eq!(players.try_recv(), None);

    conn.handle_message(&reply("all_players", json!([])));
    assert_eq!(players.try_recv(), Some(Ok(json!([]))));
}

#[tokio::test]
async fn push_handler_returns_after_send_failure() {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    drop(rx);
    let conn = ServerConn::new(tx, ConnConfig::default()).unwrap();
    let mut players = conn.register_all_players();

    let err = conn
        .request(Request::GetPlayers {
            lobby_id: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "channel_error");

    conn.handle_message(&reply("all_players", json!([{"id": "c"}])));
    assert_eq!(players.try_recv(), Some(Ok(json!([{"id": "c"}]))));
}

#[tokio::test]
async fn server_error_routes_to_request() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::JoinLobby {
        lobby_id: "nope".into(),
    });
    conn.handle_message(
        r#"{"command":"join_lobby_response","payload":{},"error_message":"no such lobby"}"#,
    );

    let err = pending.await.unwrap_err();
    assert_eq!(err.server_message(), Some("no such lobby"));
}

#[tokio::test]
async fn unmatched_error_goes_to_error_handler() {
    let (conn, _rx) = setup();
    let mut errors = conn.register_error();
    conn.handle_message(r#"{"command":"return_time","payload":{},"error_message":"late failure"}"#);

    let err = errors.try_recv().unwrap().unwrap_err();
    assert_eq!(err.command, "return_time");
    assert_eq!(err.message, "late failure");
}

#[tokio::test]
async fn command_error_handler_is_fallback() {
    let (conn, _rx) = setup();
    let mut errors = conn.register_command_error();
    conn.handle_message(r#"{"command":"teleport","payload":{},"error_message":"unknown command"}"#);

    assert_eq!(
        errors.try_recv().unwrap().unwrap_err().message,
        "unknown command"
    );
}

// --- Pushes ---

#[tokio::test]
async fn push_handlers_receive_every_push_in_order() {
    let (conn, _rx) = setup();
    let mut lobbies = conn.register_all_lobbies();
    let mut begin = conn.register_push(Command::BeginGame).unwrap();

    conn.handle_message(&reply("all_lobbies", json!(["a"])));
    conn.handle_message(&reply("begin_game", json!({"start": "Cat"})));
    conn.handle_message(&reply("all_lobbies", json!(["a", "b"])));

    assert_eq!(lobbies.try_recv(), Some(Ok(json!(["a"]))));
    assert_eq!(lobbies.try_recv(), Some(Ok(json!(["a", "b"]))));
    assert_eq!(lobbies.try_recv(), None);
    assert_eq!(begin.try_recv(), Some(Ok(json!({"start": "Cat"}))));
}

#[tokio::test]
async fn registering_again_replaces_handler() {
    let (conn, _rx) = setup();
    let mut first = conn.register_end_game();
    let mut second = conn.register_end_game();

    conn.handle_message(&reply("end_game", json!({"winner": "p1"})));

    assert_eq!(first.recv().await, None);
    assert_eq!(second.try_recv(), Some(Ok(json!({"winner": "p1"}))));
}

// --- Readiness ---

#[tokio::test]
async fn ready_to_send_callbacks_run_in_order_on_assignment() {
    let (conn, mut rx) = setup();
    let order = Arc::new(Mutex::new(Vec::new()));
    let issued: Arc<Mutex<Option<PendingReply>>> = Arc::new(Mutex::new(None));

    for i in 0..3 {
        let order = order.clone();
        conn.when_ready_to_send(move |id| order.lock().unwrap().push(format!("{i}:{id}")));
    }
    {
        // Requests issued from inside a callback must work.
        let conn2 = conn.clone();
        let issued = issued.clone();
        conn.when_ready_to_send(move |_| {
            *issued.lock().unwrap() = Some(conn2.submit(Request::GetTime));
        });
    }

    assert!(order.lock().unwrap().is_empty());
    assert!(!conn.is_ready_to_send());

    assign_id(&conn, "c1");
    assert_eq!(*order.lock().unwrap(), vec!["0:c1", "1:c1", "2:c1"]);
    assert_eq!(conn.client_id(), Some(ClientId::new("c1")));
    assert_eq!(drain(&mut rx), vec![json!({"command": "get_time", "payload": {}})]);

    conn.handle_message(&reply("return_time", json!({"time": 3})));
    let pending = issued.lock().unwrap().take().unwrap();
    assert_eq!(pending.await.unwrap(), Reply::Payload(json!({"time": 3})));

    // Once ready, callbacks run immediately.
    let order2 = order.clone();
    conn.when_ready_to_send(move |_| order2.lock().unwrap().push("late".into()));
    assert_eq!(order.lock().unwrap().last().unwrap(), "late");
}

#[tokio::test]
async fn ready_to_send_future_resolves_with_id() {
    let (conn, _rx) = setup();
    let waiter = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.ready_to_send().await })
    };
    tokio::task::yield_now().await;
    assign_id(&conn, "abc");
    assert_eq!(waiter.await.unwrap().unwrap(), ClientId::new("abc"));
}

#[tokio::test]
async fn assignment_is_cached() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = IdentityCache::new(tmp.path(), TimeDelta::minutes(60));
    let (tx, _rx) = mpsc::unbounded_channel::<String>();
    let conn = ServerConn::with_identity_cache(tx, ConnConfig::default(), cache.clone()).unwrap();

    assign_id(&conn, "p-9");
    assert_eq!(cache.load().unwrap().unwrap().id, ClientId::new("p-9"));
}

#[tokio::test]
async fn overlong_cache_ttl_does_not_break_assignment() {
    let tmp = tempfile::tempdir().unwrap();
    let ttl = TimeDelta::try_minutes(1_000_000_000_000).unwrap();
    let cache = IdentityCache::new(tmp.path(), ttl);
    let (tx, _rx) = mpsc::unbounded_channel::<String>();
    let conn = ServerConn::with_identity_cache(tx, ConnConfig::default(), cache.clone()).unwrap();
    let pending = conn.submit(Request::GetTime);

    let dispatcher = {
        let conn = conn.clone();
        tokio::spawn(async move { assign_id(&conn, "p-1") })
    };
    dispatcher.await.unwrap();

    assert_eq!(conn.client_id(), Some(ClientId::new("p-1")));
    assert_eq!(cache.load().unwrap().unwrap().id, ClientId::new("p-1"));
    conn.handle_message(&reply("return_time", json!({"time": 1})));
    assert_eq!(pending.await.unwrap().into_payload(), json!({"time": 1}));
    assert!(!conn.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callbacks_registered_during_assignment_run_after_queued_ones() {
    for _ in 0..500 {
        let (conn, _rx) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            conn.when_ready_to_send(move |_| order.lock().unwrap().push("queued"));
        }

        let assigner = {
            let conn = conn.clone();
            tokio::spawn(async move { assign_id(&conn, "c1") })
        };
        let late = {
            let conn = conn.clone();
            let order = order.clone();
            tokio::spawn(async move {
                while !conn.is_ready_to_send() {
                    tokio::task::yield_now().await;
                }
                conn.when_ready_to_send(move |_| order.lock().unwrap().push("later"));
            })
        };
        assigner.await.unwrap();
        late.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["queued", "later"]);
    }
}

// --- Replay ---

#[tokio::test]
async fn early_pushes_replay_once_to_late_handler() {
    let (conn, _rx) = setup();
    conn.handle_message(&reply("all_players", json!([{"id": "a"}])));
    conn.handle_message(&reply("all_players", json!([{"id": "a"}, {"id": "b"}])));

    let mut players = None;
    conn.when_ready_to_receive(|| players = Some(conn.register_all_players()));
    let mut players = players.unwrap();

    assert_eq!(players.try_recv(), Some(Ok(json!([{"id": "a"}]))));
    assert_eq!(players.try_recv(), Some(Ok(json!([{"id": "a"}, {"id": "b"}]))));
    assert_eq!(players.try_recv(), None);

    // A second readiness registration does not duplicate deliveries.
    conn.when_ready_to_receive(|| {});
    assert_eq!(players.try_recv(), None);

    // Live pushes are delivered once.
    conn.handle_message(&reply("all_players", json!([])));
    conn.when_ready_to_receive(|| {});
    assert_eq!(players.try_recv(), Some(Ok(json!([]))));
    assert_eq!(players.try_recv(), None);
}

#[tokio::test]
async fn replacement_handler_gets_replay() {
    let (conn, _rx) = setup();
    let mut first = conn.register_all_lobbies();
    conn.handle_message(&reply("all_lobbies", json!(["x"])));
    assert_eq!(first.try_recv(), Some(Ok(json!(["x"]))));

    let mut second = None;
    conn.when_ready_to_receive(|| second = Some(conn.register_all_lobbies()));
    assert_eq!(second.unwrap().try_recv(), Some(Ok(json!(["x"]))));
}

#[tokio::test]
async fn live_push_follows_buffered_ones() {
    let (conn, _rx) = setup();
    conn.handle_message(&reply("all_lobbies", json!(["old"])));
    let mut lobbies = conn.register_all_lobbies();

    // No replay yet; the live push must not jump the queue.
    conn.handle_message(&reply("all_lobbies", json!(["new"])));
    assert_eq!(lobbies.try_recv(), Some(Ok(json!(["old"]))));
    assert_eq!(lobbies.try_recv(), Some(Ok(json!(["new"]))));

    conn.when_ready_to_receive(|| {});
    assert_eq!(lobbies.try_recv(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_and_live_push_race_keeps_arrival_order() {
    for _ in 0..500 {
        let (conn, _rx) = setup();
        conn.handle_message(&reply("all_lobbies", json!(["old"])));
        let mut lobbies = conn.register_all_lobbies();

        let replayer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.when_ready_to_receive(|| {}) })
        };
        let live = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.handle_message(&reply("all_lobbies", json!(["new"]))) })
        };
        replayer.await.unwrap();
        live.await.unwrap();

        assert_eq!(lobbies.try_recv(), Some(Ok(json!(["old"]))));
        assert_eq!(lobbies.try_recv(), Some(Ok(json!(["new"]))));
        assert_eq!(lobbies.try_recv(), None);
    }
}

#[tokio::test]
async fn reply_consumed_by_request_is_not_replayed() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::GetPlayers {
        lobby_id: String::new(),
    });
    conn.handle_message(&reply("all_players", json!([{"id": "a"}])));
    assert_eq!(pending.await.unwrap().into_payload(), json!([{"id": "a"}]));

    let mut players = None;
    conn.when_ready_to_receive(|| players = Some(conn.register_all_players()));
    assert_eq!(players.unwrap().try_recv(), None);
}

#[tokio::test]
async fn buffered_reply_never_resolves_later_request() {
    let (conn, _rx) = setup();
    conn.handle_message(&reply("return_time", json!({"time": 0})));

    let _pending = conn.submit(Request::GetTime);
    conn.when_ready_to_receive(|| {});
    assert_eq!(conn.pending_count(), 1);
}

#[tokio::test]
async fn buffered_error_replays_to_error_handler() {
    let (conn, _rx) = setup();
    conn.handle_message(r#"{"command":"error","payload":{},"error_message":"kicked"}"#);

    let mut errors = None;
    conn.when_ready_to_receive(|| errors = Some(conn.register_error()));
    assert_eq!(
        errors.unwrap().try_recv().unwrap().unwrap_err().message,
        "kicked"
    );
}

#[tokio::test(start_paused = true)]
async fn buffering_stops_after_replay_window() {
    let (conn, _rx) = setup();
    conn.when_ready_to_receive(|| {});

    tokio::time::advance(Duration::from_millis(5_001)).await;
    tokio::task::yield_now().await;

    conn.handle_message(&reply("begin_game", json!({})));
    let mut begin = None;
    conn.when_ready_to_receive(|| begin = Some(conn.register_begin_game()));
    assert_eq!(begin.unwrap().try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn each_readiness_registration_extends_window() {
    let (conn, _rx) = setup();
    conn.when_ready_to_receive(|| {});
    tokio::time::advance(Duration::from_secs(4)).await;
    conn.when_ready_to_receive(|| {});
    tokio::time::advance(Duration::from_secs(4)).await;
    tokio::task::yield_now().await;

    conn.handle_message(&reply("begin_game", json!({"n": 1})));
    let mut begin = None;
    conn.when_ready_to_receive(|| begin = Some(conn.register_begin_game()));
    assert_eq!(begin.unwrap().try_recv(), Some(Ok(json!({"n": 1}))));
}

#[tokio::test]
async fn replay_buffer_is_bounded() {
    let (conn, _rx) = setup_with(ConnConfig {
        replay_capacity: 2,
        ..ConnConfig::default()
    });
    for n in 0..4 {
        conn.handle_message(&reply("all_lobbies", json!([n])));
    }

    let mut lobbies = None;
    conn.when_ready_to_receive(|| lobbies = Some(conn.register_all_lobbies()));
    let mut lobbies = lobbies.unwrap();
    assert_eq!(lobbies.try_recv(), Some(Ok(json!([2]))));
    assert_eq!(lobbies.try_recv(), Some(Ok(json!([3]))));
    assert_eq!(lobbies.try_recv(), None);
}

// --- Close ---

#[tokio::test]
async fn close_fails_everything_outstanding() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::GetTime);
    let mut lobbies = conn.register_all_lobbies();
    let waiter = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.ready_to_send().await })
    };
    tokio::task::yield_now().await;

    conn.handle_close();

    assert_eq!(pending.await.unwrap_err(), RequestError::ConnectionClosed);
    assert_eq!(lobbies.recv().await, None);
    assert_eq!(
        waiter.await.unwrap().unwrap_err(),
        RequestError::ConnectionClosed
    );
    assert!(conn.is_closed());
    conn.closed().await;

    let late = conn.request(Request::GetTime).await;
    assert_eq!(late.unwrap_err(), RequestError::ConnectionClosed);
    assert_eq!(conn.pending_count(), 0);

    // Messages after close are ignored.
    assign_id(&conn, "too-late");
    assert!(conn.client_id().is_none());
}

#[tokio::test]
async fn pump_feeds_frames_then_closes() {
    let (conn, _rx) = setup();
    let pending = conn.submit(Request::GetTime);
    let frames = vec![
        json!({"command": "notify_id", "client_id": "c9", "error_message": ""}).to_string(),
        "garbage".to_string(),
        reply("return_time", json!({"time": 5})),
    ];

    conn.pump(futures::stream::iter(frames)).await;

    assert_eq!(pending.await.unwrap().into_payload(), json!({"time": 5}));
    assert_eq!(conn.client_id(), Some(ClientId::new("c9")));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn spawned_reader_closes_when_sender_drops() {
    let (conn, _rx) = setup();
    let (frames_tx, frames_rx) = futures::channel::mpsc::unbounded::<String>();
    let reader = conn.spawn_reader(frames_rx);

    let pending = conn.submit(Request::GetTime);
    frames_tx
        .unbounded_send(reply("return_time", json!({"time": 11})))
        .unwrap();
    assert_eq!(pending.await.unwrap().into_payload(), json!({"time": 11}));

    drop(frames_tx);
    reader.await.unwrap();
    conn.closed().await;
    assert!(conn.is_closed());
}
