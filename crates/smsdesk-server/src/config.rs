use anyhow::{Context, Result};
use serde::Deserialize;
use smsdesk::protocol::{Role, User};
use smsdesk_store::{MessageStore, NewPhoneNumber};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::realtime::TransportKind;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// SQLite file; `None` keeps everything in memory.
    pub database: Option<PathBuf>,
    pub allow_origins: Vec<String>,
    pub realtime: RealtimeConfig,
    pub carrier: CarrierConfig,
    pub users: Vec<UserSeed>,
    pub phone_numbers: Vec<PhoneNumberSeed>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RealtimeConfig {
    pub transport: TransportKind,
    /// Events kept per scope for `Last-Event-ID` replay (channel transport).
    pub history: usize,
    /// Broadcast buffer per scope before slow subscribers start lagging.
    pub capacity: usize,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CarrierKind {
    #[default]
    Loopback,
    Twilio,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CarrierConfig {
    pub kind: CarrierKind,
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserSeed {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub admin_id: Option<String>,
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PhoneNumberSeed {
    pub id: String,
    pub admin_id: String,
    pub phone_number: String,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl ServerConfig {
    /// Load from `path`, else `$SMSDESK_CONFIG`, else the XDG location, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var_os("SMSDESK_CONFIG")
                .map(PathBuf::from)
                .or_else(|| Some(Self::config_path()).filter(|p| p.exists())),
        };
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let config: ServerConfig = toml::from_str(&contents)
                    .with_context(|| format!("invalid config {}", path.display()))?;
                tracing::info!(path = %path.display(), "loaded config");
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn config_path() -> PathBuf {
        config_dir().join("server.toml")
    }

    /// Write users and phone numbers into the store. Admins go first so
    /// members and numbers can reference them.
    pub fn seed(&self, store: &MessageStore) -> Result<()> {
        let (admins, members): (Vec<&UserSeed>, Vec<&UserSeed>) =
            self.users.iter().partition(|u| u.role == Role::Admin);
        for seed in admins.into_iter().chain(members) {
            let user = User {
                id: seed.id.clone(),
                name: seed.name.clone(),
                role: seed.role,
                admin_id: seed.admin_id.clone(),
            };
            store
                .upsert_user(&user, &seed.token)
                .with_context(|| format!("failed to seed user {}", seed.id))?;
        }

        for seed in &self.phone_numbers {
            store
                .upsert_phone_number(&NewPhoneNumber {
                    id: seed.id.clone(),
                    admin_id: seed.admin_id.clone(),
                    phone_number: seed.phone_number.clone(),
                    active: seed.active,
                })
                .with_context(|| format!("failed to seed phone number {}", seed.id))?;
            match &seed.assigned_to {
                Some(member) => store.assign(&seed.id, member),
                None => store.unassign(&seed.id),
            }
            .with_context(|| format!("failed to assign phone number {}", seed.id))?;
        }

        tracing::info!(
            users = self.users.len(),
            phone_numbers = self.phone_numbers.len(),
            "seeded directory"
        );
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database: Some(default_database_path()),
            allow_origins: vec!["http://localhost:3000".to_string()],
            realtime: RealtimeConfig::default(),
            carrier: CarrierConfig::default(),
            users: Vec::new(),
            phone_numbers: Vec::new(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Socket,
            history: 64,
            capacity: 256,
        }
    }
}

fn default_true() -> bool {
    true
}

fn config_dir() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("smsdesk")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("smsdesk")
    } else {
        PathBuf::from("/tmp/smsdesk")
    }
}

/// `$SMSDESK_STATE_DIR/smsdesk.db`, else `~/.local/state/smsdesk/smsdesk.db`.
pub fn default_database_path() -> PathBuf {
    let dir = if let Ok(dir) = std::env::var("SMSDESK_STATE_DIR") {
        PathBuf::from(dir)
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("state").join("smsdesk")
    } else {
        PathBuf::from("/tmp/smsdesk")
    };
    dir.join("smsdesk.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen = "0.0.0.0:9000"
allow_origins = ["*"]

[realtime]
transport = "channel"
history = 16

[carrier]
kind = "twilio"
account_sid = "AC1"
auth_token = "secret"

[[users]]
id = "u-admin"
name = "Ada"
role = "admin"
token = "admin-token"

[[users]]
id = "u-member"
name = "Mo"
role = "member"
admin_id = "u-admin"
token = "member-token"

[[phone_numbers]]
id = "pn-1"
admin_id = "u-admin"
phone_number = "+15550000001"
assigned_to = "u-member"
"#;

    #[test]
    fn parses_full_config() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.realtime.transport, TransportKind::Channel);
        assert_eq!(config.realtime.history, 16);
        assert_eq!(config.realtime.capacity, 256);
        assert_eq!(config.carrier.kind, CarrierKind::Twilio);
        assert_eq!(config.users.len(), 2);
        assert!(config.phone_numbers[0].active);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.realtime.transport, TransportKind::Socket);
        assert_eq!(config.carrier.kind, CarrierKind::Loopback);
    }

    #[test]
    fn seed_populates_store_in_order() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        let store = MessageStore::open_in_memory().unwrap();
        config.seed(&store).unwrap();

        let member = store.user_by_token("member-token").unwrap().unwrap();
        let numbers = store.phone_numbers_for(&member).unwrap();
        assert_eq!(numbers.len(), 1);
        assert_eq!(numbers[0].assigned_to.as_deref(), Some("u-member"));

        // seeding twice is harmless
        config.seed(&store).unwrap();
    }

    #[test]
    fn load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.allow_origins, vec!["*"]);
    }
}
