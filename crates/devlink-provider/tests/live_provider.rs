//! Live provider against a local WebSocket pairing endpoint

use devlink_auth::{CredentialRecord, CredentialStorage, CredentialStore, SessionId};
use devlink_provider::{AttachRequest, CloseReason, LiveProvider, ProviderEvent, RetryPolicy};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

fn request() -> AttachRequest {
    AttachRequest {
        session_id: SessionId::new(),
        tenant_id: Uuid::new_v4(),
        device_info: Some("Kitchen tablet".into()),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 2,
        base: Duration::from_millis(10),
        max: Duration::from_millis(20),
    }
}

async fn next_event(connection: &mut devlink_provider::ProviderConnection) -> Option<ProviderEvent> {
    tokio::time::timeout(Duration::from_secs(5), connection.next_event())
        .await
        .expect("provider event timed out")
}

#[tokio::test]
async fn live_provider_rotates_hands_over_creds_and_pairs() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hello_tx, hello_rx) = oneshot::channel::<Value>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let hello = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
            other => panic!("expected hello, got {:?}", other),
        };
        hello_tx.send(hello).unwrap();

        for frame in [
            json!({"type": "qr", "payload": "qr-1"}),
            json!({"type": "creds", "key_type": "noise-key", "material": "abc"}),
            json!({"type": "qr", "payload": "qr-2"}),
            json!({"type": "paired", "device_info": "Pixel 8"}),
        ] {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }

        // Client closes after pairing
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let credentials = Arc::new(CredentialStorage::in_memory());
    let provider = LiveProvider::new(format!("ws://{}", addr), credentials.clone())
        .unwrap()
        .with_retry(fast_retry());
    let request = request();
    let mut connection = provider.connect(request.clone());

    assert_eq!(
        next_event(&mut connection).await,
        Some(ProviderEvent::QrRotated("qr-1".into()))
    );
    assert_eq!(
        next_event(&mut connection).await,
        Some(ProviderEvent::Credentials {
            key_type: "noise-key".into(),
            material: "abc".into(),
        })
    );
    assert_eq!(
        next_event(&mut connection).await,
        Some(ProviderEvent::QrRotated("qr-2".into()))
    );
    assert_eq!(
        next_event(&mut connection).await,
        Some(ProviderEvent::Paired {
            device_info: Some("Pixel 8".into())
        })
    );
    assert_eq!(next_event(&mut connection).await, None);

    let hello = hello_rx.await.unwrap();
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["session_id"], request.session_id.to_string());
    assert_eq!(hello["device_info"], "Kitchen tablet");
    assert_eq!(hello["resume"], json!({}));

    // Persisting is the receiver's job
    assert!(credentials.load(&request.session_id).await.unwrap().is_empty());

    server.await.unwrap();
}

#[tokio::test]
async fn live_provider_resumes_with_persisted_material() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hello_tx, hello_rx) = oneshot::channel::<Value>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            hello_tx
                .send(serde_json::from_str::<Value>(&text).unwrap())
                .unwrap();
        }
        ws.send(Message::Text(
            json!({"type": "close", "reason": "logged out"}).to_string(),
        ))
        .await
        .unwrap();
    });

    let credentials = Arc::new(CredentialStorage::in_memory());
    let request = request();
    credentials
        .put(CredentialRecord::new(request.session_id.clone(), "noise-key", "abc"))
        .await
        .unwrap();
    credentials
        .put(CredentialRecord::new(request.session_id.clone(), "identity", "xyz"))
        .await
        .unwrap();

    let provider = LiveProvider::new(format!("ws://{}", addr), credentials)
        .unwrap()
        .with_retry(fast_retry());
    let mut connection = provider.connect(request);

    assert_eq!(
        next_event(&mut connection).await,
        Some(ProviderEvent::Closed(CloseReason::Remote("logged out".into())))
    );

    let hello = hello_rx.await.unwrap();
    assert_eq!(
        hello["resume"],
        json!({"identity": "xyz", "noise-key": "abc"})
    );
    server.await.unwrap();
}

#[tokio::test]
async fn live_provider_reports_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let provider = LiveProvider::new(
        format!("ws://{}", addr),
        Arc::new(CredentialStorage::in_memory()),
    )
    .unwrap()
    .with_retry(fast_retry());
    let mut connection = provider.connect(request());

    assert!(matches!(
        next_event(&mut connection).await,
        Some(ProviderEvent::Closed(CloseReason::ConnectFailed(_)))
    ));
    assert_eq!(next_event(&mut connection).await, None);
}

#[tokio::test]
async fn dropping_connection_closes_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _hello = ws.next().await;
        ws.send(Message::Text(
            json!({"type": "qr", "payload": "qr-1"}).to_string(),
        ))
        .await
        .unwrap();

        loop {
            match ws.next().await {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => continue,
                _ => break,
            }
        }
        let _ = closed_tx.send(());
    });

    let provider = LiveProvider::new(
        format!("ws://{}", addr),
        Arc::new(CredentialStorage::in_memory()),
    )
    .unwrap()
    .with_retry(fast_retry());
    let mut connection = provider.connect(request());

    assert_eq!(
        next_event(&mut connection).await,
        Some(ProviderEvent::QrRotated("qr-1".into()))
    );
    drop(connection);

    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("remote never saw the connection close")
        .unwrap();
}

#[tokio::test]
async fn malformed_frame_closes_with_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _hello = ws.next().await;
        let _ = ws.send(Message::Text("not json".into())).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let provider = LiveProvider::new(
        format!("ws://{}", addr),
        Arc::new(CredentialStorage::in_memory()),
    )
    .unwrap();
    let mut connection = provider.connect(request());

    assert!(matches!(
        next_event(&mut connection).await,
        Some(ProviderEvent::Closed(CloseReason::Protocol(_)))
    ));
}
