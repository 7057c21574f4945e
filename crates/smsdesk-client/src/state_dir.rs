use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_STATE_DIR: &str = ".local/state/smsdesk";
const LAST_PHONE_FILE: &str = "last-phone";

/// Return the smsdesk state directory path.
///
/// Priority: `$SMSDESK_STATE_DIR` env var, then `~/.local/state/smsdesk`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("SMSDESK_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// Ensure the state directory exists with `0700` permissions.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create state dir {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set state dir permissions {}", path.display()))?;
    }
    Ok(())
}

/// Phone-number id that was active when the last session ended.
pub fn load_last_phone(dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(dir.join(LAST_PHONE_FILE)).ok()?;
    let id = raw.trim();
    (!id.is_empty()).then(|| id.to_string())
}

pub fn save_last_phone(dir: &Path, phone_number_id: &str) -> Result<()> {
    ensure_state_dir(dir)?;
    let path = dir.join(LAST_PHONE_FILE);
    std::fs::write(&path, format!("{phone_number_id}\n"))
        .with_context(|| format!("failed to write {}", path.display()))
}
