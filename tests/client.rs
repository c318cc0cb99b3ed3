//! Client transport integration tests

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use sous_gateway::client::{ClientSessionTransport, SessionParams, TransportEvent, live_cooking_url};
use sous_gateway::{AudioFormat, AudioFrame, ConnectionState, ControlMessage};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// What the fake relay does once the socket is accepted
enum Script {
    /// Greet, then echo what it receives to the test until the client closes
    Greet,
    /// Send nothing until the client closes
    Silent,
    /// Greet, then close with an error
    Reject,
}

struct FakeRelay {
    url: Url,
    authorization: oneshot::Receiver<Option<String>>,
    received: mpsc::UnboundedReceiver<Message>,
}

async fn fake_relay(script: Script) -> FakeRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, authorization) = oneshot::channel();
    let (received_tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let header = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let _ = auth_tx.send(header);
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        match script {
            Script::Greet => {
                ws.send(Message::Text(ControlMessage::SetupAck.to_json().into()))
                    .await
                    .unwrap();
                ws.send(Message::Binary(Bytes::from_static(&[1, 0, 2, 0])))
                    .await
                    .unwrap();
            }
            Script::Silent => {}
            Script::Reject => {
                ws.send(Message::Text(ControlMessage::SetupAck.to_json().into()))
                    .await
                    .unwrap();
                ws.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "upstream error: connection reset".into(),
                })))
                .await
                .unwrap();
            }
        }

        // Reading also answers the client's close handshake
        while let Some(Ok(msg)) = ws.next().await {
            let _ = received_tx.send(msg);
        }
    });

    let url = live_cooking_url(
        &format!("ws://{addr}"),
        &SessionParams {
            recipe_id: Uuid::new_v4(),
            step_index: 1,
            version_id: None,
        },
    )
    .unwrap();

    FakeRelay {
        url,
        authorization,
        received,
    }
}

fn token() -> SecretString {
    SecretString::from("test-token".to_string())
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> Option<TransportEvent> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
}

#[tokio::test]
async fn opens_on_first_message_and_exchanges_audio() {
    let mut relay = fake_relay(Script::Greet).await;
    let mut transport = ClientSessionTransport::new();
    let mut states = transport.subscribe();

    let mut events = transport.connect(&relay.url, &token()).await.unwrap();
    assert_eq!(
        relay.authorization.await.unwrap().as_deref(),
        Some("Bearer test-token")
    );

    assert_eq!(
        next_event(&mut events).await,
        Some(TransportEvent::Control(ControlMessage::SetupAck))
    );
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Open))
        .await
        .expect("open in time")
        .unwrap();

    match next_event(&mut events).await {
        Some(TransportEvent::Audio(frame)) => {
            assert_eq!(frame.sequence, 0);
            assert_eq!(frame.format, AudioFormat::PLAYBACK);
            assert_eq!(frame.data, Bytes::from_static(&[1, 0, 2, 0]));
        }
        other => panic!("expected audio, got {other:?}"),
    }

    let sender = transport.sender().unwrap();
    assert!(sender.send(AudioFrame::outbound(0, Bytes::from_static(&[9, 0, 8, 0]))));
    let received = tokio::time::timeout(WAIT, relay.received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, Message::Binary(Bytes::from_static(&[9, 0, 8, 0])));

    transport.close(1000, "done").await;
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(!sender.send(AudioFrame::outbound(1, Bytes::from_static(&[0, 0]))));
}

#[tokio::test]
async fn frames_are_dropped_until_the_relay_speaks() {
    let relay = fake_relay(Script::Silent).await;
    let mut transport = ClientSessionTransport::new();

    let _events = transport.connect(&relay.url, &token()).await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connecting);

    let sender = transport.sender().unwrap();
    assert!(!sender.send(AudioFrame::outbound(0, Bytes::from_static(&[1, 0]))));

    transport.close(1000, "cancelled").await;
    assert_eq!(transport.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn unexpected_close_fails_the_transport() {
    let relay = fake_relay(Script::Reject).await;
    let mut transport = ClientSessionTransport::new();

    let mut events = transport.connect(&relay.url, &token()).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Some(TransportEvent::Control(ControlMessage::SetupAck))
    );
    // Reader exits and drops the event channel
    assert_eq!(next_event(&mut events).await, None);

    match transport.state() {
        ConnectionState::Failed(reason) => assert!(reason.contains("1011"), "{reason}"),
        other => panic!("expected failure, got {other}"),
    }

    // Closing a failed transport is a no-op
    transport.close(1000, "bye").await;
    assert!(matches!(transport.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn refused_connection_fails_and_can_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = live_cooking_url(
        &format!("ws://{addr}"),
        &SessionParams {
            recipe_id: Uuid::new_v4(),
            step_index: 0,
            version_id: None,
        },
    )
    .unwrap();

    let mut transport = ClientSessionTransport::new();
    assert!(transport.connect(&url, &token()).await.is_err());
    assert!(matches!(transport.state(), ConnectionState::Failed(_)));

    // A failed transport may be connected again
    let relay = fake_relay(Script::Silent).await;
    let _events = transport.connect(&relay.url, &token()).await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connecting);
    transport.close(1000, "bye").await;
}
