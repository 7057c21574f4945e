use futures_util::{SinkExt, StreamExt};
use smsdesk::protocol::{Event, EventName, RealtimeEvent, Scope, SocketClientFrame, SocketServerFrame};
use smsdesk_client::realtime::{ChannelConnector, EventStream, RealtimeConnector, SocketConnector};
use smsdesk_server::realtime::TransportKind;
use smsdesk_tests::harness::init_tracing;
use smsdesk_tests::harness::server::{ADMIN_TOKEN, ASSIGNED_NUMBER, MEMBER_TOKEN, POOL_NUMBER, TestServer};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const CUSTOMER: &str = "+15557654321";

async fn next_event(stream: &mut EventStream) -> RealtimeEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("event within 5s")
        .expect("stream open")
        .expect("valid event")
}

async fn next_frame<S>(ws: &mut S) -> SocketServerFrame
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("socket ok");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).expect("server frame");
        }
    }
}

#[tokio::test]
async fn socket_frames_subscribe_and_deliver() {
    init_tracing();
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();
    let url = format!("ws://{}/realtime/socket?token={MEMBER_TOKEN}", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let send = |frame: SocketClientFrame| WsMessage::Text(serde_json::to_string(&frame).unwrap().into());
    ws.send(send(SocketClientFrame::Subscribe {
        scope: Scope::User("u1".into()),
    }))
    .await
    .unwrap();
    assert!(matches!(next_frame(&mut ws).await, SocketServerFrame::Subscribed { .. }));

    // another user's scope is refused
    ws.send(send(SocketClientFrame::Subscribe {
        scope: Scope::User("u2".into()),
    }))
    .await
    .unwrap();
    match next_frame(&mut ws).await {
        SocketServerFrame::Error { scope, .. } => assert_eq!(scope, Some(Scope::User("u2".into()))),
        other => panic!("expected error, got {other:?}"),
    }

    ws.send(send(SocketClientFrame::Ping)).await.unwrap();
    assert!(matches!(next_frame(&mut ws).await, SocketServerFrame::Pong));

    server.deliver(CUSTOMER, ASSIGNED_NUMBER, "ping me", "SM1").await;
    let mut names = Vec::new();
    while names.len() < 2 {
        if let SocketServerFrame::Event { event } = next_frame(&mut ws).await {
            assert_eq!(event.scope, Scope::User("u1".into()));
            names.push(event.event.name());
        }
    }
    assert_eq!(names, vec![EventName::NewMessage, EventName::ContactUpdated]);
}

#[tokio::test]
async fn socket_connector_receives_admin_events() {
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();
    let connector = SocketConnector::new(&server.base_url(), ADMIN_TOKEN);
    let mut stream = connector
        .connect(&[Scope::Admin("a1".into()), Scope::Phone(POOL_NUMBER.into())], None)
        .await
        .unwrap();

    server.deliver(CUSTOMER, POOL_NUMBER, "hello pool", "SM2").await;
    let event = next_event(&mut stream).await;
    match event.event {
        Event::NewMessage { message } => assert_eq!(message.body, "hello pool"),
        other => panic!("expected new_message, got {other:?}"),
    }
}

#[tokio::test]
async fn socket_connector_rejects_foreign_scope() {
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();
    let connector = SocketConnector::new(&server.base_url(), MEMBER_TOKEN);
    let result = connector.connect(&[Scope::Phone(POOL_NUMBER.into())], None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn channel_delivers_and_resumes_after_last_event() {
    init_tracing();
    let server = TestServer::spawn(TransportKind::Channel).await.unwrap();
    let connector =
        ChannelConnector::new(&server.base_url(), MEMBER_TOKEN, Duration::from_secs(5)).unwrap();
    let scopes = [Scope::User("u1".into())];
    let mut stream = connector.connect(&scopes, None).await.unwrap();

    server.deliver(CUSTOMER, ASSIGNED_NUMBER, "first", "SM10").await;
    server.deliver(CUSTOMER, ASSIGNED_NUMBER, "second", "SM11").await;

    let first = next_event(&mut stream).await;
    assert_eq!(first.event.name(), EventName::NewMessage);
    drop(stream);

    // everything after the first event is replayed, in order
    let mut resumed = connector.connect(&scopes, Some(first.serial)).await.unwrap();
    let mut serials = Vec::new();
    let mut bodies = Vec::new();
    for _ in 0..3 {
        let event = next_event(&mut resumed).await;
        serials.push(event.serial);
        if let Event::NewMessage { message } = event.event {
            bodies.push(message.body);
        }
    }
    assert!(serials.iter().all(|s| *s > first.serial));
    assert!(serials.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(bodies, vec!["second".to_string()]);
}

#[tokio::test]
async fn channel_refuses_unauthorized_scope() {
    let server = TestServer::spawn(TransportKind::Channel).await.unwrap();
    let connector =
        ChannelConnector::new(&server.base_url(), MEMBER_TOKEN, Duration::from_secs(5)).unwrap();
    let result = connector.connect(&[Scope::Admin("a1".into())], None).await;
    assert!(result.is_err());
}
