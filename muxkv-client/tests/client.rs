mod support;

use std::thread;
use std::time::Duration;

use muxkv_client::{
    BacklogPolicy, ClientError, ClientTtl, ConfigError, KVClient, Message, RespValue, SendError,
};

use support::{config, init_tracing, spawn_server, spawn_server_on, unused_addr, Session};

#[test]
fn blocking_commands_roundtrip() {
    init_tracing();
    let (addr, journal) = spawn_server(vec![Session::UntilEof]);
    let client = KVClient::connect_blocking(config(addr, BacklogPolicy::Default)).expect("client");

    client.set_blocking(b"key", b"value").expect("set");
    assert_eq!(client.get_blocking(b"key").expect("get"), Some(b"value".to_vec()));
    assert_eq!(client.get_blocking(b"missing").expect("get"), None);
    assert_eq!(client.ttl_blocking(b"key").expect("ttl"), ClientTtl::NoExpiry);
    assert!(client.expire_blocking(b"key", Duration::from_secs(30)).expect("expire"));
    assert_eq!(
        client.ttl_blocking(b"key").expect("ttl"),
        ClientTtl::ExpiresIn(Duration::from_secs(30))
    );
    assert!(client.delete_blocking(b"key").expect("del"));
    assert!(!client.delete_blocking(b"key").expect("del"));
    assert_eq!(client.ttl_blocking(b"key").expect("ttl"), ClientTtl::Missing);
    assert_eq!(client.ping_blocking(None).expect("ping"), b"PONG".to_vec());
    assert_eq!(client.ping_blocking(Some(b"hi")).expect("ping"), b"hi".to_vec());
    assert!(client.info_blocking().expect("info").starts_with(b"# Server"));

    match client.execute_blocking(&[b"FLUSHALL"]) {
        Err(ClientError::Server { message }) => assert!(message.starts_with(b"ERR unknown")),
        other => panic!("unexpected result: {:?}", other),
    }

    assert_eq!(journal.names()[0], "SET key value");
    let status = client.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_commands_pipeline_in_order() {
    init_tracing();
    let (addr, journal) = spawn_server(vec![Session::UntilEof]);
    let client = KVClient::connect(config(addr, BacklogPolicy::Default)).expect("client");

    client
        .set_with_ttl(b"session", b"abc", Duration::from_secs(90))
        .await
        .expect("set");
    let (value, ttl, pong) = tokio::join!(
        client.get(b"session"),
        client.ttl(b"session"),
        client.ping(None)
    );
    assert_eq!(value.expect("get"), Some(b"abc".to_vec()));
    assert_eq!(ttl.expect("ttl"), ClientTtl::ExpiresIn(Duration::from_secs(90)));
    assert_eq!(pong.expect("ping"), b"PONG".to_vec());

    assert_eq!(journal.names()[0], "SET session abc EX 90");
    client.shutdown();
}

#[test]
fn reconnects_after_server_drops_connection() {
    init_tracing();
    let (addr, journal) = spawn_server(vec![Session::Commands(1), Session::UntilEof]);
    let client = KVClient::connect_blocking(config(addr, BacklogPolicy::Default)).expect("client");

    client.set_blocking(b"k", b"v").expect("set");
    // Let the client notice the hang-up and dial the second session.
    thread::sleep(Duration::from_millis(300));

    assert_eq!(client.get_blocking(b"k").expect("get"), Some(b"v".to_vec()));
    assert_eq!(journal.names(), vec!["SET k v".to_string(), "GET k".to_string()]);
    assert!(client.status()[0].connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backlog_drains_in_order_once_server_appears() {
    init_tracing();
    let addr = unused_addr();
    let client = KVClient::connect(config(addr, BacklogPolicy::Default)).expect("client");
    let mux = client.multiplexer();

    let pending: Vec<_> = (0..3)
        .map(|i| mux.send(Message::command(&["ECHO", i.to_string().as_str()])))
        .collect();
    let status = client.status();
    assert!(!status[0].connected);
    assert_eq!(status[0].backlog_pending, 3);

    let journal = spawn_server_on(addr, vec![Session::UntilEof]);
    for (i, reply) in pending.into_iter().enumerate() {
        let reply = tokio::time::timeout(Duration::from_secs(2), reply)
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply, RespValue::Bulk(Some(i.to_string().into_bytes())));
    }
    assert_eq!(journal.names(), vec!["ECHO 0", "ECHO 1", "ECHO 2"]);

    let status = client.status();
    assert_eq!(status[0].backlog_pending, 0);
    assert_eq!(status[0].total_backlog_queued, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn never_connected_backlog_times_out() {
    init_tracing();
    let mut settings = config(unused_addr(), BacklogPolicy::Default);
    settings.async_timeout_ms = 100;
    let client = KVClient::connect(settings).expect("client");
    // Give the first connect attempt time to fail and be recorded.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = tokio::time::timeout(Duration::from_secs(2), client.get(b"k"))
        .await
        .expect("resolved in time");
    match result {
        Err(ClientError::Send(err @ SendError::BacklogTimeout { .. })) => {
            let text = err.to_string();
            assert!(text.contains("never connected"), "{}", text);
            match err {
                SendError::BacklogTimeout {
                    waited,
                    ever_connected,
                    last_error,
                } => {
                    assert!(waited >= Duration::from_millis(100));
                    assert!(!ever_connected);
                    assert!(last_error.is_some());
                }
                _ => unreachable!(),
            }
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_fast_rejects_without_connection() {
    init_tracing();
    let client = KVClient::connect(config(unused_addr(), BacklogPolicy::FailFast)).expect("client");
    tokio::time::sleep(Duration::from_millis(100)).await;

    match client.ping(None).await {
        Err(ClientError::Send(SendError::NoConnectionAvailable { last_error })) => {
            assert!(last_error.is_some());
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.status()[0].total_backlog_queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backlog_timeout_after_loss_reports_prior_connection() {
    init_tracing();
    let (addr, _journal) = spawn_server(vec![Session::Commands(1)]);
    let mut settings = config(addr, BacklogPolicy::Default);
    settings.async_timeout_ms = 100;
    let client = KVClient::connect(settings).expect("client");

    client.set(b"k", b"v").await.expect("set");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.status()[0].connected);

    match client.get(b"k").await {
        Err(ClientError::Send(SendError::BacklogTimeout { ever_connected, .. })) => {
            assert!(ever_connected);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_fails_backlogged_messages() {
    init_tracing();
    let client = KVClient::connect(config(unused_addr(), BacklogPolicy::Default)).expect("client");
    let pending = client.multiplexer().send(Message::command(&["PING"]));
    client.shutdown();

    assert!(matches!(pending.await, Err(SendError::Dropped)));
    assert!(matches!(
        client.ping(None).await,
        Err(ClientError::Send(SendError::Dropped))
    ));
}

#[test]
fn rejects_unparseable_address() {
    let mut settings = config(unused_addr(), BacklogPolicy::Default);
    settings.addr = "not-an-address".to_string();
    assert!(matches!(
        KVClient::connect_blocking(settings),
        Err(ClientError::InvalidAddress)
    ));
}

#[test]
fn rejects_zero_connections() {
    let mut settings = config(unused_addr(), BacklogPolicy::Default);
    settings.connections = 0;
    assert!(matches!(
        KVClient::connect_blocking(settings),
        Err(ClientError::Config(ConfigError::NoConnections))
    ));
}

#[test]
fn async_connect_outside_runtime_is_rejected() {
    let settings = config(unused_addr(), BacklogPolicy::Default);
    assert!(matches!(KVClient::connect(settings), Err(ClientError::Runtime(_))));
}

#[test]
fn blocking_call_gives_up_when_server_never_replies() {
    init_tracing();
    let (addr, journal) = spawn_server(vec![Session::Silent]);
    let mut settings = config(addr, BacklogPolicy::Default);
    settings.sync_timeout_ms = 200;
    let client = KVClient::connect_blocking(settings).expect("client");
    // Wait for the connection so the command is written, not backlogged.
    while !client.status()[0].connected {
        thread::sleep(Duration::from_millis(5));
    }

    match client.get_blocking(b"k") {
        Err(ClientError::Send(SendError::ReplyTimeout { waited })) => {
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(journal.names(), vec!["GET k"]);
}

#[test]
fn blocking_backlog_expiry_wins_over_reply_timeout() {
    init_tracing();
    let mut settings = config(unused_addr(), BacklogPolicy::Default);
    settings.sync_timeout_ms = 100;
    let client = KVClient::connect_blocking(settings).expect("client");

    match client.ping_blocking(None) {
        Err(ClientError::Send(SendError::BacklogTimeout { ever_connected, .. })) => {
            assert!(!ever_connected);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
