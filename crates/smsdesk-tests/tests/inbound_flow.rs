use smsdesk::client::ApiError;
use smsdesk_server::realtime::TransportKind;
use smsdesk_tests::harness::init_tracing;
use smsdesk_tests::harness::server::{ADMIN_TOKEN, ASSIGNED_NUMBER, MEMBER_TOKEN, POOL_NUMBER, TestServer};

const CUSTOMER: &str = "+15557654321";

#[tokio::test]
async fn inbound_sms_is_stored_and_counted() {
    init_tracing();
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();

    let resp = server.deliver(CUSTOMER, ASSIGNED_NUMBER, "is the shop open?", "SM100").await;
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/xml"), "{content_type}");
    assert_eq!(resp.text().await.unwrap(), "<Response></Response>");

    let member = server.client(MEMBER_TOKEN);
    let contacts = member.contacts("pn-1").await.unwrap();
    assert_eq!(contacts.len(), 1);
    let contact = &contacts[0];
    assert_eq!(contact.phone_number, CUSTOMER);
    assert_eq!(contact.unread_count, 1);
    assert_eq!(contact.last_message.as_deref(), Some("is the shop open?"));

    let messages = member.conversation(&contact.id, Some(CUSTOMER)).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from, CUSTOMER);
    assert_eq!(messages[0].to, ASSIGNED_NUMBER);
    assert_eq!(messages[0].sid.as_deref(), Some("SM100"));
}

#[tokio::test]
async fn redelivered_sid_is_ignored() {
    init_tracing();
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();

    for _ in 0..3 {
        let resp = server.deliver(CUSTOMER, ASSIGNED_NUMBER, "hello", "SM200").await;
        assert_eq!(resp.status(), 200);
    }
    server.deliver(CUSTOMER, ASSIGNED_NUMBER, "second", "SM201").await;

    let member = server.client(MEMBER_TOKEN);
    let contacts = member.contacts("pn-1").await.unwrap();
    assert_eq!(contacts[0].unread_count, 2);
    let messages = member.conversation(&contacts[0].id, None).await.unwrap();
    let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["hello", "second"]);
}

#[tokio::test]
async fn mark_read_clears_unread() {
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();
    server.deliver(CUSTOMER, ASSIGNED_NUMBER, "one", "SM300").await;
    server.deliver(CUSTOMER, ASSIGNED_NUMBER, "two", "SM301").await;

    let member = server.client(MEMBER_TOKEN);
    let contact = member.contacts("pn-1").await.unwrap().remove(0);
    assert_eq!(contact.unread_count, 2);
    member.mark_read(&contact.id).await.unwrap();
    // idempotent
    member.mark_read(&contact.id).await.unwrap();
    assert_eq!(member.contacts("pn-1").await.unwrap()[0].unread_count, 0);
}

#[tokio::test]
async fn unassigned_number_lands_with_admin() {
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();
    server.deliver(CUSTOMER, POOL_NUMBER, "anyone there?", "SM400").await;

    let admin = server.client(ADMIN_TOKEN);
    let contacts = admin.contacts("pn-2").await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].unread_count, 1);

    let member = server.client(MEMBER_TOKEN);
    let err = member.contacts("pn-2").await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 403, .. }), "{err:?}");
}

#[tokio::test]
async fn webhook_rejects_unknown_number_and_missing_fields() {
    let server = TestServer::spawn(TransportKind::Socket).await.unwrap();
    let resp = server.deliver(CUSTOMER, "+15559990000", "hi", "SM500").await;
    assert_eq!(resp.status(), 404);

    let resp = reqwest::Client::new()
        .post(format!("{}/webhook/sms", server.base_url()))
        .form(&[("From", CUSTOMER), ("Body", "no recipient")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "invalid");
}
