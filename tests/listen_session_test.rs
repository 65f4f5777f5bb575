//! End-to-end listen session tests against an in-process relay

use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use hookrelay::forward::{Forwarder, ForwarderOptions};
use hookrelay::relay::{
    ListenRequest, ListenerOptions, RelayError, RelayListener, ReplayMarker, SessionState,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type ServerWs = WebSocketStream<TcpStream>;

/// What the relay saw during the upgrade
#[derive(Debug)]
struct Handshake {
    path: String,
    authorization: Option<String>,
    body: Option<String>,
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Accept one client and hand the socket to `script`
async fn spawn_relay<F, Fut>(script: F) -> (String, oneshot::Receiver<Handshake>)
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handshake_tx, handshake_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut captured = None;
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
            captured = Some(Handshake {
                path: req.uri().path().to_string(),
                authorization: header_value(req, "authorization"),
                body: header_value(req, "body"),
            });
            Ok(resp)
        })
        .await
        .unwrap();

        if let Some(handshake) = captured {
            let _ = handshake_tx.send(handshake);
        }
        script(ws).await;
    });

    (format!("http://{}", addr), handshake_rx)
}

/// Next frame that is not a ping or pong
async fn next_app_message(ws: &mut ServerWs) -> Option<Message> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(message) => return Some(message),
            Err(_) => return None,
        }
    }
    None
}

/// Close from the relay side and let the client finish the handshake
async fn close_from_relay(mut ws: ServerWs) {
    let _ = ws.close(None).await;
    while let Some(Ok(_)) = ws.next().await {}
}

fn listener(host: &str) -> RelayListener {
    let mut options = ListenerOptions::new(host, "device-token");
    options.shutdown_grace = Duration::from_millis(300);

    let forwarder = Forwarder::new(ForwarderOptions {
        timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();

    RelayListener::new(options, forwarder)
}

fn request(forward_to: &str) -> ListenRequest {
    ListenRequest {
        host_name: "dev-laptop".to_string(),
        project_id: "proj_1".to_string(),
        device_id: "dev_1".to_string(),
        source_id: None,
        forward_to: forward_to.to_string(),
        since: None,
    }
}

#[tokio::test]
async fn test_event_is_forwarded_and_acknowledged() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("x-foo", "bar"))
        .and(header("content-type", "application/json"))
        .and(body_json(serde_json::json!({ "k": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_string("echo"))
        .expect(1)
        .mount(&target)
        .await;

    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let (host, handshake_rx) = spawn_relay(move |mut ws| async move {
        ws.send(Message::Text(
            r#"{"uid":"e1","headers":{"X-Foo":["bar"]},"data":{"k":1}}"#.to_string(),
        ))
        .await
        .unwrap();

        if let Some(message) = next_app_message(&mut ws).await {
            let _ = ack_tx.send(message);
        }
        close_from_relay(ws).await;
    })
    .await;

    let listener = listener(&host);
    let stats = timeout(
        TEST_TIMEOUT,
        listener.listen(
            &request(&format!("{}/hook", target.uri())),
            std::future::pending::<()>(),
        ),
    )
    .await
    .expect("session should end when the relay closes")
    .unwrap();

    let ack = ack_rx.recv().await.unwrap();
    assert_eq!(ack, Message::Text(r#"{"uid":"e1"}"#.to_string()));

    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.events_forwarded, 1);
    assert_eq!(stats.acks_sent, 1);
    assert_eq!(listener.state(), SessionState::Closed);

    let handshake = handshake_rx.await.unwrap();
    assert_eq!(handshake.path, "/stream/listen");
    assert_eq!(
        handshake.authorization.as_deref(),
        Some("Bearer device-token")
    );
    let body: serde_json::Value = serde_json::from_str(&handshake.body.unwrap()).unwrap();
    assert_eq!(body["device_id"], "dev_1");
    assert_eq!(body["project_id"], "proj_1");
    assert!(body.get("source_id").is_none());
}

#[tokio::test]
async fn test_acknowledgments_follow_receipt_order() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        for uid in ["e1", "e2", "e3"] {
            let frame = format!(r#"{{"uid":"{}","headers":{{}},"data":{{}}}}"#, uid);
            ws.send(Message::Text(frame)).await.unwrap();
        }
        for _ in 0..3 {
            if let Some(message) = next_app_message(&mut ws).await {
                let _ = ack_tx.send(message);
            }
        }
        close_from_relay(ws).await;
    })
    .await;

    let listener = listener(&host);
    let stats = timeout(
        TEST_TIMEOUT,
        listener.listen(&request(&target.uri()), std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();

    let mut acks = Vec::new();
    while let Ok(message) = ack_rx.try_recv() {
        acks.push(message);
    }
    assert_eq!(
        acks,
        vec![
            Message::Text(r#"{"uid":"e1"}"#.to_string()),
            Message::Text(r#"{"uid":"e2"}"#.to_string()),
            Message::Text(r#"{"uid":"e3"}"#.to_string()),
        ]
    );
    assert_eq!(stats.acks_sent, 3);
}

#[tokio::test]
async fn test_replay_marker_is_first_message() {
    let (first_tx, first_rx) = oneshot::channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        if let Some(message) = next_app_message(&mut ws).await {
            let _ = first_tx.send(message);
        }
        close_from_relay(ws).await;
    })
    .await;

    let mut req = request("http://127.0.0.1:9/hook");
    req.since = ReplayMarker::parse("2013-01-02T13:23:37Z").unwrap();

    let listener = listener(&host);
    timeout(
        TEST_TIMEOUT,
        listener.listen(&req, std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        first_rx.await.unwrap(),
        Message::Text("since|timestamp|2013-01-02T13:23:37Z".to_string())
    );
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let (ack_tx, ack_rx) = oneshot::channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        ws.send(Message::Text("not an event".to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"uid":"e2","data":{"ok":true}}"#.to_string()))
            .await
            .unwrap();

        if let Some(message) = next_app_message(&mut ws).await {
            let _ = ack_tx.send(message);
        }
        close_from_relay(ws).await;
    })
    .await;

    let listener = listener(&host);
    let stats = timeout(
        TEST_TIMEOUT,
        listener.listen(&request(&target.uri()), std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        ack_rx.await.unwrap(),
        Message::Text(r#"{"uid":"e2"}"#.to_string())
    );
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.malformed_frames, 1);
    assert_eq!(stats.acks_sent, 1);
}

#[tokio::test]
async fn test_failed_forward_is_still_acknowledged() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let refused = format!("http://{}/hook", closed.local_addr().unwrap());
    drop(closed);

    let (ack_tx, ack_rx) = oneshot::channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        ws.send(Message::Text(r#"{"uid":"e9","data":{}}"#.to_string()))
            .await
            .unwrap();
        if let Some(message) = next_app_message(&mut ws).await {
            let _ = ack_tx.send(message);
        }
        close_from_relay(ws).await;
    })
    .await;

    let listener = listener(&host);
    let stats = timeout(
        TEST_TIMEOUT,
        listener.listen(&request(&refused), std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        ack_rx.await.unwrap(),
        Message::Text(r#"{"uid":"e9"}"#.to_string())
    );
    assert_eq!(stats.forward_failures, 1);
    assert_eq!(stats.events_forwarded, 0);
    assert_eq!(stats.acks_sent, 1);
}

#[tokio::test]
async fn test_interrupt_sends_disconnect_and_close_within_grace() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let (host, handshake_rx) = spawn_relay(move |mut ws| async move {
        let mut seen = Vec::new();
        while let Some(message) = next_app_message(&mut ws).await {
            let is_close = matches!(message, Message::Close(_));
            seen.push(message);
            if is_close {
                break;
            }
        }
        let _ = seen_tx.send(seen);

        // Never answer the close handshake
        sleep(Duration::from_secs(5)).await;
        drop(ws);
    })
    .await;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let interrupt = async move {
        let _ = stop_rx.await;
    };

    let listener = listener(&host);
    let req = request("http://127.0.0.1:9/hook");

    let trigger = async move {
        handshake_rx.await.unwrap();
        sleep(Duration::from_millis(100)).await;
        stop_tx.send(()).unwrap();
        Instant::now()
    };

    let (result, interrupted_at) = timeout(
        TEST_TIMEOUT,
        async { tokio::join!(listener.listen(&req, interrupt), trigger) },
    )
    .await
    .unwrap();

    let stats = result.unwrap();
    assert!(interrupted_at.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.frames_received, 0);
    assert_eq!(listener.state(), SessionState::Closed);

    let seen = seen_rx.await.unwrap();
    assert_eq!(seen.len(), 2, "unexpected frames: {:?}", seen);
    assert_eq!(seen[0], Message::Text("disconnect".to_string()));
    match &seen[1] {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_handshake_surfaces_relay_body() {
    let listener_socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener_socket.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener_socket.accept().await.unwrap();
        let _ = accept_hdr_async(stream, |_req: &Request, _resp: Response| {
            let mut rejection = ErrorResponse::new(Some("invalid api key".to_string()));
            *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
            Err(rejection)
        })
        .await;
    });

    let listener = listener(&format!("http://{}", addr));
    let result = timeout(
        TEST_TIMEOUT,
        listener.listen(
            &request("http://127.0.0.1:9/hook"),
            std::future::pending::<()>(),
        ),
    )
    .await
    .unwrap();

    match result {
        Err(RelayError::Handshake(message)) => {
            assert_eq!(message, "invalid api key");
        }
        other => panic!("expected handshake error, got {:?}", other),
    }
    assert!(matches!(listener.state(), SessionState::Failed(_)));
}

/// Accepts TCP connections and never answers the upgrade
async fn spawn_silent_relay() -> String {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = socket.accept().await {
            held.push(stream);
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_event_with_null_headers_is_acknowledged() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let (ack_tx, ack_rx) = oneshot::channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        ws.send(Message::Text(
            r#"{"uid":"n1","headers":null,"data":{"k":1}}"#.to_string(),
        ))
        .await
        .unwrap();
        if let Some(message) = next_app_message(&mut ws).await {
            let _ = ack_tx.send(message);
        }
        close_from_relay(ws).await;
    })
    .await;

    let listener = listener(&host);
    let stats = timeout(
        TEST_TIMEOUT,
        listener.listen(&request(&target.uri()), std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        ack_rx.await.unwrap(),
        Message::Text(r#"{"uid":"n1"}"#.to_string())
    );
    assert_eq!(stats.malformed_frames, 0);
    assert_eq!(stats.events_forwarded, 1);
    assert_eq!(stats.acks_sent, 1);
}

#[tokio::test]
async fn test_duration_replay_marker_keeps_operator_text() {
    let (first_tx, first_rx) = oneshot::channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        if let Some(message) = next_app_message(&mut ws).await {
            let _ = first_tx.send(message);
        }
        close_from_relay(ws).await;
    })
    .await;

    let mut req = request("http://127.0.0.1:9/hook");
    req.since = ReplayMarker::parse("42m").unwrap();

    let listener = listener(&host);
    timeout(
        TEST_TIMEOUT,
        listener.listen(&req, std::future::pending::<()>()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        first_rx.await.unwrap(),
        Message::Text("since|duration|42m".to_string())
    );
}

#[tokio::test]
async fn test_interrupt_lets_in_flight_event_finish() {
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(600)))
        .expect(1)
        .mount(&target)
        .await;

    let (sent_tx, sent_rx) = oneshot::channel();
    let (seen_tx, seen_rx) = oneshot::channel();
    let (host, _handshake) = spawn_relay(move |mut ws| async move {
        ws.send(Message::Text(r#"{"uid":"slow","data":{}}"#.to_string()))
            .await
            .unwrap();
        let _ = sent_tx.send(());

        let mut seen = Vec::new();
        while let Some(message) = next_app_message(&mut ws).await {
            let is_close = matches!(message, Message::Close(_));
            seen.push(message);
            if is_close {
                break;
            }
        }
        let _ = seen_tx.send(seen);
        sleep(Duration::from_secs(5)).await;
        drop(ws);
    })
    .await;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let interrupt = async move {
        let _ = stop_rx.await;
    };
    let trigger = async move {
        sent_rx.await.unwrap();
        // Lands while the target is still sitting on the request
        sleep(Duration::from_millis(200)).await;
        stop_tx.send(()).unwrap();
    };

    let listener = listener(&host);
    let req = request(&target.uri());
    let (result, _) = timeout(TEST_TIMEOUT, async {
        tokio::join!(listener.listen(&req, interrupt), trigger)
    })
    .await
    .unwrap();

    let stats = result.unwrap();
    assert_eq!(stats.events_forwarded, 1);
    assert_eq!(stats.acks_sent, 1);

    let seen = seen_rx.await.unwrap();
    assert_eq!(seen.len(), 3, "unexpected frames: {:?}", seen);
    assert_eq!(seen[0], Message::Text(r#"{"uid":"slow"}"#.to_string()));
    assert_eq!(seen[1], Message::Text("disconnect".to_string()));
    assert!(matches!(seen[2], Message::Close(_)));
}

#[tokio::test]
async fn test_unanswered_handshake_times_out() {
    let host = spawn_silent_relay().await;

    let mut options = ListenerOptions::new(&host, "device-token");
    options.handshake_timeout = Duration::from_millis(300);
    let forwarder = Forwarder::new(ForwarderOptions::default()).unwrap();
    let listener = RelayListener::new(options, forwarder);

    let started = Instant::now();
    let result = timeout(
        TEST_TIMEOUT,
        listener.listen(
            &request("http://127.0.0.1:9/hook"),
            std::future::pending::<()>(),
        ),
    )
    .await
    .expect("handshake should be bounded");

    assert!(matches!(result, Err(RelayError::Handshake(_))));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(listener.state(), SessionState::Failed(_)));
}

#[tokio::test]
async fn test_interrupt_during_handshake_ends_session() {
    let host = spawn_silent_relay().await;

    // Default handshake timeout; only the interrupt can end this quickly
    let listener = listener(&host);
    let result = timeout(
        Duration::from_secs(3),
        listener.listen(&request("http://127.0.0.1:9/hook"), async {}),
    )
    .await
    .expect("interrupt should end a pending handshake");

    assert!(matches!(result, Err(RelayError::Handshake(_))));
    assert!(matches!(listener.state(), SessionState::Failed(_)));
}
