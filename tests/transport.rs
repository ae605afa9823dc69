//! Transport adapter against a scripted NDJSON server

mod support;

use chatsync::engine::{
    BlockType, ClientFrame, CloseHandle, ConnectionManager, ConnectionState, ConversationEvent,
    ConversationId, EventKind, Role, ServerFrame, Subscriber, TransportError, VocabularyError,
    stream_conversation,
};
use futures::StreamExt;
use support::*;

fn c1() -> ConversationId {
    ConversationId::new("c1")
}

#[tokio::test]
async fn handshake_delivers_snapshot_then_events() {
    let (client, mut server) = ScriptedServer::pair();

    let serve = tokio::spawn(async move {
        let request = server
            .accept(snapshot("c1", vec![message("c1", "m1", Role::User, 1)]))
            .await;
        server
            .send_event("c1", &block_delta("m1", "b1", "Hi"))
            .await;
        server.hang_up().await;
        server.expect_eof().await;
        request
    });

    let stream = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .expect("streamable ids");
    assert_eq!(stream.snapshot.messages.len(), 1);

    let mut events = stream.events;
    let event = events.next().await.unwrap().unwrap();
    assert_eq!(event.kind(), EventKind::BlockDelta);
    assert!(events.next().await.is_none());
    assert!(events.next().await.is_none());

    let request = serve.await.unwrap();
    assert_eq!(
        request,
        ClientFrame::Subscribe {
            conversation_id: c1(),
            user_id: Some("u1".to_string()),
        }
    );
}

#[tokio::test]
async fn frames_for_other_conversations_are_filtered() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        server
            .send_event("c2", &block_delta("m9", "b9", "not yours"))
            .await;
        server
            .send_event("c1", &block_delta("m1", "b1", "yours"))
            .await;
        server.hang_up().await;
    });

    let stream = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap();
    let received: Vec<_> = stream
        .events
        .into_stream()
        .map(|event| event.unwrap())
        .collect()
        .await;

    assert_eq!(received, vec![block_delta("m1", "b1", "yours")]);
}

#[tokio::test]
async fn error_frame_before_snapshot_fails_the_open() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.expect_subscribe().await;
        server
            .send(&ServerFrame::Error {
                conversation_id: None,
                message: "forbidden".to_string(),
            })
            .await;
    });

    let result = stream_conversation(client, Some(&c1()), Some("u1")).await;
    assert!(matches!(result, Err(TransportError::Remote(message)) if message == "forbidden"));
}

#[tokio::test]
async fn hang_up_before_snapshot_is_an_error() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.expect_subscribe().await;
        server.hang_up().await;
    });

    let result = stream_conversation(client, Some(&c1()), Some("u1")).await;
    assert!(matches!(result, Err(TransportError::ClosedBeforeSnapshot)));
}

#[tokio::test]
async fn malformed_frame_fails_the_open() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.expect_subscribe().await;
        server.send_raw("{not json\n").await;
    });

    let result = stream_conversation(client, Some(&c1()), Some("u1")).await;
    assert!(matches!(result, Err(TransportError::MalformedFrame(_))));
}

#[tokio::test]
async fn unknown_event_kind_fails_closed() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        server
            .send_raw(
                r#"{"type":"event","conversationId":"c1","event":{"type":"message-exploded"}}"#,
            )
            .await;
        server.send_raw("\n").await;
        server
            .send_event("c1", &block_delta("m1", "b1", "after"))
            .await;
    });

    let mut events = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap()
        .events;

    let failure = events.next().await.unwrap();
    assert!(matches!(
        failure,
        Err(TransportError::Vocabulary(VocabularyError::UnknownKind(kind)))
            if kind == "message-exploded"
    ));
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn error_frame_mid_stream_ends_the_stream() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        server
            .send(&ServerFrame::Error {
                conversation_id: Some(ConversationId::new("c1")),
                message: "conversation deleted".to_string(),
            })
            .await;
    });

    let mut events = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap()
        .events;

    assert!(matches!(events.next().await, Some(Err(TransportError::Remote(_)))));
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn close_wakes_a_pending_next_and_shuts_the_socket() {
    let (client, mut server) = ScriptedServer::pair();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    let serve = tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        ready_rx.await.unwrap();
        server.expect_eof().await;
    });

    let mut events = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap()
        .events;
    let closer = events.closer();

    let pending = tokio::spawn(async move { events.next().await.is_none() });
    tokio::task::yield_now().await;

    assert!(closer.close());
    assert!(!closer.close());
    assert!(tokio::time::timeout(STEP, pending).await.unwrap().unwrap());

    ready_tx.send(()).unwrap();
    serve.await.unwrap();
}

#[tokio::test]
async fn close_before_snapshot_cancels_the_open_and_shuts_the_socket() {
    let (client, mut server) = ScriptedServer::pair();
    let closer = CloseHandle::new(c1());

    let opening = tokio::spawn({
        let closer = closer.clone();
        async move {
            Subscriber::new(client)
                .with_closer(closer)
                .stream(Some(&c1()), Some("u1"))
                .await
        }
    });

    server.expect_subscribe().await;
    assert!(closer.close());

    let result = tokio::time::timeout(STEP, opening).await.unwrap().unwrap();
    assert!(matches!(result, Err(TransportError::Cancelled)));
    server.expect_eof().await;
}

#[tokio::test]
async fn buffered_frames_are_dropped_after_close() {
    let (client, mut server) = ScriptedServer::pair();
    let (sent_tx, sent_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        for delta in ["one", "two", "three"] {
            server
                .send_event("c1", &block_delta("m1", "b1", delta))
                .await;
        }
        sent_tx.send(()).unwrap();
        server.expect_eof().await;
    });

    let mut events = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap()
        .events;
    sent_rx.await.unwrap();

    let first = events.next().await.unwrap().unwrap();
    assert_eq!(first, block_delta("m1", "b1", "one"));

    assert!(events.close());
    assert!(events.next().await.is_none());
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn subscribed_frame_after_snapshot_is_ignored() {
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        server
            .send(&ServerFrame::Subscribed {
                conversation_id: None,
            })
            .await;
        server
            .send_event("c1", &block_start("m1", "b1", BlockType::Thinking))
            .await;
        server.hang_up().await;
    });

    let mut events = stream_conversation(client, Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap()
        .events;
    assert!(matches!(
        events.next().await,
        Some(Ok(ConversationEvent::BlockStart { .. }))
    ));
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn lease_tracks_the_socket_lifetime() {
    let manager = ConnectionManager::new();
    let (client, mut server) = ScriptedServer::pair();

    tokio::spawn(async move {
        server.accept(snapshot("c1", Vec::new())).await;
        server.expect_eof().await;
    });

    manager.begin_connect();
    let stream = Subscriber::new(client)
        .with_lease(manager.register())
        .stream(Some(&c1()), Some("u1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    let mut state = manager.subscribe();
    stream.events.close();
    tokio::time::timeout(
        STEP,
        state.wait_for(|state| matches!(state, ConnectionState::Disconnected { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(manager.live_connections(), 0);
}
