use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tdlayer_client::{
    Client, Config, DispatcherState, InvocationError, MemoryTransport, NoRetries, Request,
    TransportError,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn fast() -> Config {
    Config { poll_timeout: Duration::from_millis(20), ..Default::default() }
}

fn started(transport: &Arc<MemoryTransport>, config: Config) -> Client {
    let client = Client::new(transport.clone(), config).unwrap();
    client.start();
    client
}

// ── End-to-end ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_me_round_trip() {
    let transport = Arc::new(MemoryTransport::new());
    let client    = started(&transport, fast());

    let fut   = client.send(Request::new("getMe")).unwrap();
    let extra = transport.sent()[0]["@extra"].clone();
    assert_eq!(extra, json!(fut.id().to_string()));

    transport.push(json!({"@type": "user", "id": 7, "first_name": "Ann", "@extra": extra}));
    let r = timeout(WAIT, fut).await.expect("response must arrive");
    assert!(!r.is_error());
    assert_eq!(r.type_name(), "user");
    assert_eq!(r.get("first_name"), Some(&json!("Ann")));

    client.stop().await;
}

#[tokio::test]
async fn correlation_on_plain_id_field() {
    let transport = Arc::new(MemoryTransport::new());
    let client    = started(&transport, Config { correlation_field: "id".into(), ..fast() });

    let fut = client.send(Request::new("getMe")).unwrap();
    let id  = fut.id().to_string();
    assert_eq!(transport.sent()[0], json!({"@type": "getMe", "id": id}));

    transport.push(json!({"@type": "user", "id": id, "username": "ann"}));
    let r = timeout(WAIT, fut).await.unwrap();
    assert!(!r.is_error());
    assert_eq!(r.get("username"), Some(&json!("ann")));
    assert_eq!(r.get("id"), Some(&json!(id)));

    client.stop().await;
}

#[tokio::test]
async fn concurrent_requests_get_their_own_answers() {
    let transport = Arc::new(
        MemoryTransport::new().with_responder(|req| Some(json!({"@type": "ok", "n": req["n"].clone()}))),
    );
    let client = started(&transport, fast());

    let mut tasks = Vec::new();
    for n in 0..50 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let fut = client.send(Request::new("echo").with("n", n)).unwrap();
            let id  = fut.id();
            (n, id, fut.await)
        }));
    }

    let mut ids = HashSet::new();
    for t in tasks {
        let (n, id, r) = timeout(WAIT, t).await.unwrap().unwrap();
        assert!(ids.insert(id), "duplicate correlation id {id}");
        assert_eq!(r.get("n"), Some(&json!(n)));
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(client.pending_requests(), 0);

    client.stop().await;
}

#[tokio::test]
async fn error_response_is_a_value() {
    let transport = Arc::new(MemoryTransport::new().with_responder(|_| {
        Some(json!({"@type": "error", "code": 400, "message": "CHAT_NOT_FOUND"}))
    }));
    let client = started(&transport, fast());

    let r = timeout(WAIT, client.invoke(Request::new("getChat").with("chat_id", 1)))
        .await
        .unwrap()
        .unwrap();
    assert!(r.is_error());
    assert_eq!(r.error().map(|e| e.message.as_str()), Some("CHAT_NOT_FOUND"));
    assert_eq!(r.result()["code"], 400);
    assert_eq!(r.retry_after(), 0);

    client.stop().await;
}

// ── Unknown / late responses ──────────────────────────────────────────────────

#[tokio::test]
async fn unmatched_response_is_dropped() {
    let transport = Arc::new(MemoryTransport::new());
    let client    = started(&transport, fast());

    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    client.on(tdlayer_client::ANY_UPDATE, move |_, _| {
        s.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }).unwrap();

    let fut   = client.send(Request::new("getMe")).unwrap();
    let extra = transport.sent()[0]["@extra"].clone();

    transport.push(json!({"@type": "ok", "@extra": "999999"}));
    transport.push(json!({"@type": "user", "id": 1, "@extra": extra}));

    let r = timeout(WAIT, fut).await.unwrap();
    assert_eq!(r.type_name(), "user");
    assert_eq!(seen.load(Ordering::SeqCst), 0, "late responses are not updates");

    client.stop().await;
}

#[tokio::test]
async fn caller_timeout_releases_entry() {
    let transport = Arc::new(MemoryTransport::new());
    let client    = started(&transport, fast());

    let fut = client.send(Request::new("getMe")).unwrap();
    let id  = fut.id();
    assert_eq!(client.pending_requests(), 1);
    let res = fut.timeout(Duration::from_millis(30)).await;
    assert!(matches!(res, Err(InvocationError::Timeout)));
    assert_eq!(client.pending_requests(), 0);

    // A late answer for the released id goes nowhere.
    transport.push(json!({"@type": "user", "@extra": id.to_string()}));
    client.stop().await;
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_settles_all_pending() {
    let transport = Arc::new(MemoryTransport::new());
    let client    = started(&transport, fast());

    let futs: Vec<_> = (0..5)
        .map(|_| client.send(Request::new("getMe")).unwrap())
        .collect();
    assert_eq!(client.pending_requests(), 5);

    timeout(WAIT, client.stop()).await.expect("stop must be bounded by the poll timeout");
    assert_eq!(client.state(), DispatcherState::Stopped);

    for f in futs {
        let r = timeout(WAIT, f).await.unwrap();
        assert!(r.is_error());
        assert!(r.is_closed());
        assert!(matches!(r.into_result(), Err(InvocationError::Closed)));
    }

    // Requests after shutdown settle immediately.
    let late = client.send(Request::new("getMe")).unwrap();
    assert!(timeout(WAIT, late).await.unwrap().is_closed());
    assert_eq!(transport.sent().len(), 5);
}

#[tokio::test]
async fn stop_before_start() {
    let transport = Arc::new(MemoryTransport::new());
    let client    = Client::new(transport.clone(), fast()).unwrap();
    assert_eq!(client.state(), DispatcherState::NotStarted);

    let fut = client.send(Request::new("getMe")).unwrap();
    client.stop().await;
    assert_eq!(client.state(), DispatcherState::Stopped);
    assert!(timeout(WAIT, fut).await.unwrap().is_closed());

    // Stopped is terminal.
    client.start();
    assert_eq!(client.state(), DispatcherState::Stopped);
}

#[tokio::test]
async fn transport_failure_is_fatal_at_startup() {
    let transport = Arc::new(MemoryTransport::new().fail_create("libtdjson.so not found"));
    let err = Client::new(transport, fast()).unwrap_err();
    assert!(matches!(err, InvocationError::Transport(TransportError::Unavailable(_))));
}

// ── Retry / execute ───────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limited_request_is_retried_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let transport = Arc::new(MemoryTransport::new().with_responder(move |_| {
        if c.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(json!({"@type": "error", "code": 429, "message": "Too Many Requests: retry after 1"}))
        } else {
            Some(json!({"@type": "ok"}))
        }
    }));
    let client = started(&transport, fast());

    let r = timeout(Duration::from_secs(5), client.invoke(Request::new("sendMessage")))
        .await
        .unwrap()
        .unwrap();
    assert!(!r.is_error());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let sent = transport.sent();
    assert_ne!(sent[0]["@extra"], sent[1]["@extra"], "retry must use a fresh id");

    client.stop().await;
}

#[tokio::test]
async fn no_retries_returns_flood_error() {
    let transport = Arc::new(MemoryTransport::new().with_responder(|_| {
        Some(json!({"@type": "error", "code": 429, "message": "Too Many Requests: retry after 30"}))
    }));
    let client = started(&transport, Config { retry_policy: Arc::new(NoRetries), ..fast() });

    let r = timeout(WAIT, client.invoke(Request::new("sendMessage"))).await.unwrap().unwrap();
    assert!(r.is_error());
    assert_eq!(r.retry_after(), 30);
    assert_eq!(transport.sent().len(), 1);

    client.stop().await;
}

#[tokio::test]
async fn execute_only_allowlisted() {
    let transport = Arc::new(MemoryTransport::new().with_responder(|req| {
        Some(json!({"@type": "optionValueString", "value": req["name"].clone()}))
    }));
    let client = Client::new(transport.clone(), fast()).unwrap();

    let r = client.execute(&Request::new("getOption").with("name", "version")).unwrap().unwrap();
    assert_eq!(r.get("value"), Some(&json!("version")));
    assert!(r.get("@extra").is_none());

    let err = client.execute(&Request::new("sendMessage")).unwrap_err();
    assert!(matches!(err, InvocationError::NotSynchronous(t) if t == "sendMessage"));
    assert!(transport.sent().is_empty());
}
