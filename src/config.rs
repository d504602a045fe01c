use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::models::PartyId;

/// Endpoint configuration. Every field has a default so a config file only
/// needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub party_id: PartyId,
    /// Bounded wait for an Answer after placing a call.
    pub negotiating_timeout_secs: u64,
    /// Bounded wait for the local user to accept or decline.
    pub ringing_timeout_secs: u64,
    /// Delay before the single retry of a failed signaling send.
    pub transport_retry_backoff_ms: u64,
    /// How long a dropped peer connection may take to recover before the
    /// call fails.
    pub disconnect_grace_secs: u64,
    pub ice_servers: Vec<String>,
    /// Number of ended sessions retained for post-call display.
    pub ended_history: usize,
    /// Upper bound on sessions whose candidates arrived before their Offer.
    pub max_parked_sessions: usize,
    pub max_parked_candidates: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            party_id: String::new(),
            negotiating_timeout_secs: 30,
            ringing_timeout_secs: 30,
            transport_retry_backoff_ms: 500,
            disconnect_grace_secs: 5,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ended_history: 32,
            max_parked_sessions: 64,
            max_parked_candidates: 32,
        }
    }
}

impl CallConfig {
    pub fn for_party(party_id: impl Into<PartyId>) -> Self {
        Self {
            party_id: party_id.into(),
            ..Default::default()
        }
    }

    pub fn negotiating_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiating_timeout_secs)
    }

    pub fn ringing_timeout(&self) -> Duration {
        Duration::from_secs(self.ringing_timeout_secs)
    }

    pub fn transport_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.transport_retry_backoff_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    /// Load from an explicit path, or from the platform config directory if a
    /// `call.json` exists there, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };

        let shown = path.display().to_string();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        info!("Loaded call config from {}", shown);
        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "chatr", "Chatr").map(|p| p.config_dir().join("call.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = CallConfig::default();
        assert_eq!(config.negotiating_timeout(), Duration::from_secs(30));
        assert_eq!(config.ringing_timeout(), Duration::from_secs(30));
        assert_eq!(config.transport_retry_backoff(), Duration::from_millis(500));
        assert_eq!(config.disconnect_grace(), Duration::from_secs(5));
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = std::env::temp_dir().join(format!("chatr-call-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("call.json");
        std::fs::write(&path, r#"{"partyId":"alice","ringingTimeoutSecs":5}"#).unwrap();

        let config = CallConfig::load(Some(&path)).unwrap();
        assert_eq!(config.party_id, "alice");
        assert_eq!(config.ringing_timeout(), Duration::from_secs(5));
        assert_eq!(config.negotiating_timeout(), Duration::from_secs(30));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = CallConfig::load(Some(Path::new("/nonexistent/chatr/call.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
