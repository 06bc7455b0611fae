//! RPC tests: request/reply correlation through the in-memory bus

mod common;

use common::{eventually, init_tracing, MockBus};
use esb_client::{EsbError, EventKey, Message, TYPE_SEND};
use serde_json::{json, Value};
use std::future::Ready;
use std::time::Duration;
use tokio::sync::mpsc;

async fn double(req: Message) -> anyhow::Result<Value> {
    let n = req
        .get("n")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("missing n"))?;
    Ok(json!({ "v": n * 2 }))
}

async fn explode(_req: Message) -> anyhow::Result<Value> {
    panic!("kaboom")
}

#[tokio::test]
async fn test_rpc_round_trip() {
    init_tracing();
    let bus = MockBus::start();
    let server = bus.logged_in("math").await;
    let caller = bus.logged_in("caller").await;

    server.rpc_receive("double", double).await.unwrap();

    let reply = caller.rpc_send("double", &json!({"n": 21}), None).await.unwrap();
    assert_eq!(reply.get("v"), Some(&json!(42)));
    assert_eq!(reply.meta_str("result"), Some("SUCCESS"));

    let request = bus
        .frames_of(TYPE_SEND)
        .into_iter()
        .find(|f| f.msg.meta_str("group") == Some("double"))
        .unwrap();
    assert_eq!(reply.meta_str("replyTo"), Some(request.msg.id().as_str()));
    assert_eq!(reply.meta_str("inre"), Some(request.msg.id().as_str()));
    assert_ne!(reply.id(), request.msg.id());

    assert!(caller.subscriptions().contains(&"double-result".to_string()));
}

#[tokio::test]
async fn test_handler_error_becomes_failure() {
    let bus = MockBus::start();
    let server = bus.logged_in("math").await;
    let caller = bus.logged_in("caller").await;
    server.rpc_receive("double", double).await.unwrap();

    let err = caller
        .rpc_send("double", &json!({"m": 1}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EsbError::RpcFailure { .. }));
    assert_eq!(err.reason(), Some("missing n"));
}

#[tokio::test]
async fn test_remote_failure_reason_is_propagated() {
    let bus = MockBus::start();
    let server = bus.logged_in("svc").await;
    let caller = bus.logged_in("caller").await;
    server
        .rpc_receive("fragile", |_req| async move {
            Err::<Value, _>(anyhow::anyhow!("boom"))
        })
        .await
        .unwrap();

    let err = caller.rpc_send("fragile", &json!({}), None).await.unwrap_err();
    assert_eq!(err.reason(), Some("boom"));
}

#[tokio::test]
async fn test_handler_panic_becomes_failure() {
    let bus = MockBus::start();
    let server = bus.logged_in("svc").await;
    let caller = bus.logged_in("caller").await;

    server.rpc_receive("async-panic", explode).await.unwrap();
    server
        .rpc_receive("sync-panic", |_req| -> Ready<anyhow::Result<Value>> {
            panic!("sync kaboom")
        })
        .await
        .unwrap();

    let err = caller
        .rpc_send("async-panic", &json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.reason(), Some("kaboom"));

    let err = caller
        .rpc_send("sync-panic", &json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.reason(), Some("sync kaboom"));

    // The responder keeps serving after a panic
    server.rpc_receive("double", double).await.unwrap();
    let reply = caller.rpc_send("double", &json!({"n": 2}), None).await.unwrap();
    assert_eq!(reply.get("v"), Some(&json!(4)));
}

#[tokio::test]
async fn test_rpc_times_out_without_responder() {
    let bus = MockBus::start();
    let caller = bus.logged_in("caller").await;

    let bound = Duration::from_millis(150);
    let err = caller
        .rpc_send_with_timeout("nobody", &json!({}), None, bound)
        .await
        .unwrap_err();
    assert!(matches!(err, EsbError::RpcTimeout(d) if d == bound));
}

#[tokio::test]
async fn test_close_fails_inflight_rpc_with_shutdown() {
    let bus = MockBus::start();
    let caller = bus.logged_in("caller").await;

    let call = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.rpc_send("nobody", &json!({}), None).await })
    };
    eventually("request written", || !bus.frames_of(TYPE_SEND).is_empty()).await;

    caller.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_millis(500), call)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(EsbError::Shutdown)));
}

#[tokio::test]
async fn test_concurrent_rpcs_are_correlated() {
    let bus = MockBus::start();
    let server = bus.logged_in("math").await;
    let caller = bus.logged_in("caller").await;
    server.rpc_receive("double", double).await.unwrap();

    let calls = (0..20).map(|n| {
        let caller = caller.clone();
        async move { (n, caller.rpc_send("double", &json!({"n": n}), None).await) }
    });

    for (n, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply.unwrap().get("v"), Some(&json!(n * 2)));
    }

    let subscribes = bus
        .frames_of("subscribe")
        .into_iter()
        .filter(|f| f.msg.get("channel") == Some(&json!("double-result")))
        .count();
    assert_eq!(subscribes, 1);
}

#[tokio::test]
async fn test_reply_is_copied_to_cc_groups() {
    let bus = MockBus::start();
    let server = bus.logged_in("math").await;
    let auditor = bus.logged_in("auditor").await;
    server.rpc_receive("double", double).await.unwrap();

    auditor.subscribe("audit").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    auditor.on(EventKey::group("audit"), move |msg| {
        let _ = tx.send(msg.clone());
    });

    let request = Message::new(
        json!({"id": "req-cc", "type": "sendMessage", "group": "double", "cc.group": ["audit"]}),
        json!({"n": 5}),
    )
    .unwrap();
    bus.publish(&request);

    let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.meta_str("replyTo"), Some("req-cc"));
    assert_eq!(reply.meta_str("result"), Some("SUCCESS"));
    assert_eq!(reply.groups(), vec!["audit", "double-result"]);
    assert_eq!(reply.get("v"), Some(&json!(10)));
}

#[tokio::test]
async fn test_reply_copied_into_request_group_is_not_answered() {
    let bus = MockBus::start();
    let server = bus.logged_in("math").await;
    server.rpc_receive("double", double).await.unwrap();

    let request = Message::new(
        json!({"id": "req-loop", "type": "sendMessage", "group": "double", "cc.group": ["double"]}),
        json!({"n": 3}),
    )
    .unwrap();
    bus.publish(&request);

    let replies = || {
        bus.frames_of(TYPE_SEND)
            .into_iter()
            .filter(|f| f.msg.has_meta("replyTo"))
            .count()
    };
    eventually("first reply", || replies() == 1).await;

    // The reply comes back through the request group and must be ignored
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(replies(), 1);
}

#[tokio::test]
async fn test_stopped_responder_no_longer_answers() {
    let bus = MockBus::start();
    let server = bus.logged_in("math").await;
    let caller = bus.logged_in("caller").await;

    let id = server.rpc_receive("double", double).await.unwrap();
    assert!(caller.rpc_send("double", &json!({"n": 1}), None).await.is_ok());

    assert!(server.off(id));
    let err = caller
        .rpc_send_with_timeout("double", &json!({"n": 1}), None, Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, EsbError::RpcTimeout(_)));
}
