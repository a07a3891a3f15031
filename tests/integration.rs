// tests/integration.rs
//
// End-to-end client/server tests over the in-memory substrate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use link_rpc::{
    // ---
    client,
    memory_container,
    server,
    Capabilities,
    Error,
    ErrorBody,
    MemoryHub,
    RELAY_CAPABILITY,
};

const URL: &str = "amqp://localhost:5672/examples";

const WAIT: Duration = Duration::from_secs(2);

fn add(args: Value) -> Value {
    json!(args["a"].as_i64().unwrap() + args["b"].as_i64().unwrap())
}

#[tokio::test]
async fn bind_sync_round_trip() {
    // ---
    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("add", add);

    let cli = client(container, URL).await.expect("client failed");

    let result = timeout(WAIT, cli.call("add", json!({"a": 2, "b": 3})))
        .await
        .expect("timed out")
        .expect("call failed");

    assert_eq!(result, json!(5));
}

#[tokio::test]
async fn define_installs_method_sugar() {
    // ---
    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("add", add);

    let cli = client(container, URL).await.expect("client failed");
    let add_method = cli.define("add");

    let result = timeout(WAIT, add_method.call(json!({"a": 20, "b": 22})))
        .await
        .expect("timed out")
        .expect("call failed");

    assert_eq!(result, json!(42));
    assert_eq!(add_method.name(), "add");
}

#[tokio::test]
async fn async_bind_handler_round_trip() {
    // ---
    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind("double", |args: Value| async move {
        match args.as_i64() {
            Some(n) => Ok(json!(n * 2)),
            None => Err(ErrorBody::named("type-error", "expected a number")),
        }
    });

    let cli = client(container, URL).await.expect("client failed");

    let result = timeout(WAIT, cli.call("double", json!(21)))
        .await
        .expect("timed out")
        .expect("call failed");
    assert_eq!(result, json!(42));

    // Handler-reported errors still produce a correlated reply; the error
    // payload travels as the body.
    let body = timeout(WAIT, cli.call("double", json!("nope")))
        .await
        .expect("timed out")
        .expect("call failed");
    assert_eq!(body["name"], json!("type-error"));
    assert_eq!(body["message"], json!("expected a number"));
}

#[tokio::test]
async fn calls_before_reply_link_open_flush_in_order() {
    // ---
    let hub = MemoryHub::gated();
    let container = memory_container(hub.clone());

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let srv = server(container.clone(), URL).await.expect("server failed");
    let recorder = seen.clone();
    srv.bind_sync("echo", move |args| {
        recorder.lock().unwrap().push(args["i"].as_i64().unwrap());
        args
    });

    let cli = client(container, URL).await.expect("client failed");

    // Reply link cannot open while the hub gate is shut; every submit lands
    // in the pending buffer.
    let mut replies = Vec::new();
    for i in 0..5i64 {
        replies.push(
            cli.submit("echo", json!({ "i": i }))
                .await
                .expect("submit failed"),
        );
    }

    hub.open();

    for (i, reply) in replies.into_iter().enumerate() {
        let body = timeout(WAIT, reply.response())
            .await
            .expect("timed out")
            .expect("reply dropped");
        assert_eq!(body["i"], json!(i as i64));
    }

    // All five transmitted, in original submission order, exactly once.
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn relay_capability_shares_one_reply_link() {
    // ---
    use link_rpc::{Address, Message, ReceiverSpec};

    let hub = MemoryHub::new();
    hub.offer(Capabilities::One(RELAY_CAPABILITY.into()));
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("ping", |args| args);

    // Raw caller with two distinct reply addresses.
    let conn = container
        .connect("localhost", 5672)
        .await
        .expect("connect failed");
    let mut inbox_a = conn
        .attach_receiver(ReceiverSpec::Named(Address::from("caller-a")))
        .await
        .expect("attach failed")
        .inbox;
    let mut inbox_b = conn
        .attach_receiver(ReceiverSpec::Named(Address::from("caller-b")))
        .await
        .expect("attach failed")
        .inbox;
    let requests = conn
        .attach_sender(Some(Address::from("examples")))
        .await
        .expect("attach failed");

    requests
        .send(Message::request("ping", json!(1), 101, Address::from("caller-a")))
        .await
        .expect("send failed");
    requests
        .send(Message::request("ping", json!(2), 102, Address::from("caller-b")))
        .await
        .expect("send failed");

    let to_a = timeout(WAIT, inbox_a.recv()).await.expect("timed out").expect("closed");
    let to_b = timeout(WAIT, inbox_b.recv()).await.expect("timed out").expect("closed");
    assert_eq!(to_a.properties.correlation_id, Some(101));
    assert_eq!(to_b.properties.correlation_id, Some(102));

    // One raw request sender plus exactly one server-side relay sender,
    // regardless of how many reply destinations appeared.
    assert_eq!(hub.senders_attached(), 2);
}

#[tokio::test]
async fn per_destination_links_are_cached_and_reused() {
    // ---
    use link_rpc::{Address, Message, ReceiverSpec};

    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("ping", |args| args);

    let conn = container
        .connect("localhost", 5672)
        .await
        .expect("connect failed");
    let mut inbox_a = conn
        .attach_receiver(ReceiverSpec::Named(Address::from("caller-a")))
        .await
        .expect("attach failed")
        .inbox;
    let mut inbox_b = conn
        .attach_receiver(ReceiverSpec::Named(Address::from("caller-b")))
        .await
        .expect("attach failed")
        .inbox;
    let requests = conn
        .attach_sender(Some(Address::from("examples")))
        .await
        .expect("attach failed");

    // Two distinct reply addresses create two cached links.
    requests
        .send(Message::request("ping", json!(1), 201, Address::from("caller-a")))
        .await
        .expect("send failed");
    timeout(WAIT, inbox_a.recv()).await.expect("timed out").expect("closed");

    requests
        .send(Message::request("ping", json!(2), 202, Address::from("caller-b")))
        .await
        .expect("send failed");
    timeout(WAIT, inbox_b.recv()).await.expect("timed out").expect("closed");

    assert_eq!(hub.senders_attached(), 3);

    // A third request from the first address reuses the first link.
    requests
        .send(Message::request("ping", json!(3), 203, Address::from("caller-a")))
        .await
        .expect("send failed");
    timeout(WAIT, inbox_a.recv()).await.expect("timed out").expect("closed");

    assert_eq!(hub.senders_attached(), 3);
}

#[tokio::test]
async fn bad_method_and_subjects_on_the_wire() {
    // ---
    use link_rpc::{Address, Message, ReceiverSpec, SUBJECT_BAD_METHOD, SUBJECT_OK};

    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("add", add);
    srv.bind("outside", |_args: Value| async {
        Err(ErrorBody::named("range-error", "out of range"))
    });
    srv.bind("fail", |_args: Value| async { Err(ErrorBody::new("boom")) });

    let conn = container
        .connect("localhost", 5672)
        .await
        .expect("connect failed");
    let mut inbox = conn
        .attach_receiver(ReceiverSpec::Named(Address::from("caller-1")))
        .await
        .expect("attach failed")
        .inbox;
    let requests = conn
        .attach_sender(Some(Address::from("examples")))
        .await
        .expect("attach failed");

    let reply_to = Address::from("caller-1");

    // Success: subject "ok", correlated body.
    requests
        .send(Message::request("add", json!({"a": 2, "b": 3}), 301, reply_to.clone()))
        .await
        .expect("send failed");
    let response = timeout(WAIT, inbox.recv()).await.expect("timed out").expect("closed");
    assert_eq!(response.properties.subject.as_deref(), Some(SUBJECT_OK));
    assert_eq!(response.properties.correlation_id, Some(301));
    assert_eq!(response.body, json!(5));

    // Unbound subject: structured bad-method reply, no handler involved.
    requests
        .send(Message::request("missing", json!(null), 302, reply_to.clone()))
        .await
        .expect("send failed");
    let response = timeout(WAIT, inbox.recv()).await.expect("timed out").expect("closed");
    assert_eq!(response.properties.subject.as_deref(), Some(SUBJECT_BAD_METHOD));
    assert_eq!(response.body, json!("Unrecognised method missing"));

    // Named handler error: the name becomes the subject.
    requests
        .send(Message::request("outside", json!(null), 303, reply_to.clone()))
        .await
        .expect("send failed");
    let response = timeout(WAIT, inbox.recv()).await.expect("timed out").expect("closed");
    assert_eq!(response.properties.subject.as_deref(), Some("range-error"));

    // Unnamed handler error falls back to "error".
    requests
        .send(Message::request("fail", json!(null), 304, reply_to))
        .await
        .expect("send failed");
    let response = timeout(WAIT, inbox.recv()).await.expect("timed out").expect("closed");
    assert_eq!(response.properties.subject.as_deref(), Some("error"));
    assert_eq!(response.body, json!({"message": "boom"}));
}

#[tokio::test]
async fn unmatched_response_is_dropped_not_fatal() {
    // ---
    use link_rpc::{Address, Message, ReceiverSpec, SUBJECT_OK};

    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    // Hand-rolled responder instead of RpcServer, to control correlation.
    let conn = container
        .connect("localhost", 5672)
        .await
        .expect("connect failed");
    let mut requests_inbox = conn
        .attach_receiver(ReceiverSpec::Named(Address::from("examples")))
        .await
        .expect("attach failed")
        .inbox;
    let responder = conn.attach_sender(None).await.expect("attach failed");

    let cli = client(container, URL).await.expect("client failed");
    let pending = cli.submit("add", json!(null)).await.expect("submit failed");

    let request = timeout(WAIT, requests_inbox.recv())
        .await
        .expect("timed out")
        .expect("closed");
    let reply_to = request.properties.reply_to.clone().expect("no reply_to");
    let id = request.properties.message_id.expect("no message_id");

    // A response nobody asked for: logged and dropped, no callback fires.
    responder
        .send(Message::response(reply_to.clone(), Some(id + 1000), SUBJECT_OK, json!("bogus")))
        .await
        .expect("send failed");

    // The real response still lands.
    responder
        .send(Message::response(reply_to, Some(id), SUBJECT_OK, json!("real")))
        .await
        .expect("send failed");

    let body = timeout(WAIT, pending.response())
        .await
        .expect("timed out")
        .expect("reply dropped");
    assert_eq!(body, json!("real"));
}

#[tokio::test]
async fn failed_flush_abandons_reply() {
    // ---
    let hub = MemoryHub::gated();
    let container = memory_container(hub.clone());

    let cli = client(container, URL).await.expect("client failed");

    // Buffered while the reply link is still opening.
    let pending = cli.submit("echo", json!(1)).await.expect("submit failed");

    // Closing tears down the sending link, so the flush at open must fail.
    cli.close().await.expect("close failed");
    hub.open();

    // The reply resolves as dropped rather than waiting forever.
    let err = timeout(WAIT, pending.response()).await.expect("timed out");
    assert!(matches!(err, Err(Error::ResponseDropped)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_on_multi_thread_runtime() {
    // ---
    // Background tasks may run in parallel with connect() here; the round
    // trip must still complete.
    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("add", add);

    let cli = client(container, URL).await.expect("client failed");

    let result = timeout(WAIT, cli.call("add", json!({"a": 4, "b": 4})))
        .await
        .expect("timed out")
        .expect("call failed");

    assert_eq!(result, json!(8));
}

#[tokio::test]
async fn call_with_timeout_expires_when_nobody_answers() {
    // ---
    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    // No server attached: the request goes nowhere.
    let cli = client(container, URL).await.expect("client failed");

    let err = cli
        .call_with_timeout("void", json!(null), Duration::from_millis(100))
        .await
        .expect_err("expected a timeout");

    assert!(matches!(err, Error::Timeout));
}

#[tokio::test]
async fn close_tears_down_links() {
    // ---
    let hub = MemoryHub::new();
    let container = memory_container(hub.clone());

    let srv = server(container.clone(), URL).await.expect("server failed");
    srv.bind_sync("add", add);

    let cli = client(container, URL).await.expect("client failed");
    let result = timeout(WAIT, cli.call("add", json!({"a": 1, "b": 1})))
        .await
        .expect("timed out")
        .expect("call failed");
    assert_eq!(result, json!(2));

    cli.close().await.expect("client close failed");
    srv.close().await.expect("server close failed");

    // The sending link is gone; further calls fail fast.
    let err = cli.call("add", json!({"a": 1, "b": 1})).await;
    assert!(matches!(err, Err(Error::LinkClosed(_))));
}
