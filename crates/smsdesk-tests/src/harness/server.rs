use anyhow::Result;
use smsdesk::client::ApiClient;
use smsdesk::protocol::Role;
use smsdesk_server::config::{PhoneNumberSeed, ServerConfig, UserSeed};
use smsdesk_server::realtime::TransportKind;
use smsdesk_server::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::oneshot;

pub const ADMIN_TOKEN: &str = "admin-token";
/// Member `u1`, assigned to [`ASSIGNED_NUMBER`].
pub const MEMBER_TOKEN: &str = "member-token";
/// Member `u2` of the same admin, with no number.
pub const IDLE_MEMBER_TOKEN: &str = "idle-member-token";
/// Admin of another tenant.
pub const STRANGER_TOKEN: &str = "stranger-token";

/// `pn-1`, assigned to `u1`.
pub const ASSIGNED_NUMBER: &str = "+15550000001";
/// `pn-2`, owned by `a1` and unassigned.
pub const POOL_NUMBER: &str = "+15550000002";

/// A server on a random loopback port with a temp SQLite file and seeded tenants.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _data_dir: TempDir,
}

impl TestServer {
    pub async fn spawn(transport: TransportKind) -> Result<Self> {
        let data_dir = TempDir::new()?;
        let mut config = ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            database: Some(data_dir.path().join("smsdesk.db")),
            allow_origins: vec!["*".to_string()],
            users: seed_users(),
            phone_numbers: seed_numbers(),
            ..Default::default()
        };
        config.realtime.transport = transport;

        let (addr, state, shutdown_tx) = smsdesk_server::spawn_server(&config).await?;
        tracing::debug!(%addr, transport = %transport, "test server up");
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            _data_dir: data_dir,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self, token: &str) -> ApiClient {
        ApiClient::new(&self.base_url(), token).expect("client")
    }

    /// Post an inbound SMS the way the carrier does.
    pub async fn deliver(&self, from: &str, to: &str, body: &str, sid: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/webhook/sms", self.base_url()))
            .form(&[("From", from), ("To", to), ("Body", body), ("MessageSid", sid)])
            .send()
            .await
            .expect("webhook post")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn seed_users() -> Vec<UserSeed> {
    let user = |id: &str, role: Role, admin: Option<&str>, token: &str| UserSeed {
        id: id.to_string(),
        name: id.to_uppercase(),
        role,
        admin_id: admin.map(str::to_string),
        token: token.to_string(),
    };
    vec![
        user("a1", Role::Admin, None, ADMIN_TOKEN),
        user("u1", Role::Member, Some("a1"), MEMBER_TOKEN),
        user("u2", Role::Member, Some("a1"), IDLE_MEMBER_TOKEN),
        user("a2", Role::Admin, None, STRANGER_TOKEN),
    ]
}

fn seed_numbers() -> Vec<PhoneNumberSeed> {
    let number = |id: &str, admin: &str, e164: &str, assigned: Option<&str>| PhoneNumberSeed {
        id: id.to_string(),
        admin_id: admin.to_string(),
        phone_number: e164.to_string(),
        assigned_to: assigned.map(str::to_string),
        active: true,
    };
    vec![
        number("pn-1", "a1", ASSIGNED_NUMBER, Some("u1")),
        number("pn-2", "a1", POOL_NUMBER, None),
        number("pn-3", "a2", "+15550000003", None),
    ]
}
