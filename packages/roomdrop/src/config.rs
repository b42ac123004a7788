use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [relay]
//                    port = 9000
//
//   env var:         ROOMDROP_RELAY__PORT=9000   (double underscore = nesting)
//
//   (single underscore stays within field names: ROOMDROP_SESSION__RETENTION_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Relay tunables (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_relay_port(),
        }
    }
}

/// Session tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            retention_secs: default_retention(),
            chunk_bytes: default_chunk_bytes(),
            download_dir: None,
        }
    }
}

fn default_relay_port() -> u16 {
    8787
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_reconnect_delay() -> u64 {
    3
}
fn default_retention() -> u64 {
    5
}
fn default_chunk_bytes() -> usize {
    crate::proto::CHUNK_SIZE
}

/// Build a figment that layers: defaults → config.toml → ROOMDROP_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ROOMDROP_RELAY__PORT=9000`  →  `relay.port = 9000`
///   `ROOMDROP_SESSION__RETENTION_SECS=10`  →  `session.retention_secs = 10`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("ROOMDROP_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Result<Self> {
        let host = fc.host.as_deref().unwrap_or("127.0.0.1");
        let bind_addr = format!("{}:{}", host, fc.port)
            .parse()
            .with_context(|| format!("invalid relay bind address: {}:{}", host, fc.port))?;
        Ok(Self { bind_addr })
    }
}

/// Session configuration (runtime view). `relay_url` is the full room
/// endpoint; room and relay location come from the caller, everything else
/// from the file config.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub relay_url: String,
    pub participant_id: String,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub retention: Duration,
    pub chunk_size: usize,
    pub download_dir: PathBuf,
}

impl SessionConfig {
    pub fn from_file(
        fc: &SessionFileConfig,
        relay_url: String,
        participant_id: String,
        default_download_dir: PathBuf,
    ) -> Self {
        Self {
            relay_url,
            participant_id,
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
            reconnect_delay: Duration::from_secs(fc.reconnect_delay_secs),
            retention: Duration::from_secs(fc.retention_secs),
            chunk_size: fc.chunk_bytes,
            download_dir: fc
                .download_dir
                .clone()
                .unwrap_or(default_download_dir),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RoomdropConfig {
    pub data_dir: PathBuf,
    pub downloads_dir: PathBuf,
}

impl RoomdropConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("could not find home directory")?
                .join(".roomdrop"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {:?}", data_dir))?;

        let downloads_dir = data_dir.join("downloads");
        std::fs::create_dir_all(&downloads_dir)
            .with_context(|| format!("failed to create downloads directory: {:?}", downloads_dir))?;

        info!("data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            downloads_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn relay_file_config_defaults() {
        let d = RelayFileConfig::default();
        assert!(d.host.is_none());
        assert_eq!(d.port, 8787);
    }

    #[test]
    fn session_file_config_defaults() {
        let d = SessionFileConfig::default();
        assert_eq!(d.connect_timeout_secs, 15);
        assert_eq!(d.reconnect_delay_secs, 3);
        assert_eq!(d.retention_secs, 5);
        assert_eq!(d.chunk_bytes, 64 * 1024);
        assert!(d.download_dir.is_none());
    }

    // ── runtime views ───────────────────────────────────────────────────

    #[test]
    fn relay_config_from_file() {
        let rc = RelayConfig::from_file(&RelayFileConfig::default()).unwrap();
        assert_eq!(rc.bind_addr.to_string(), "127.0.0.1:8787");

        let rc = RelayConfig::from_file(&RelayFileConfig {
            host: Some("0.0.0.0".into()),
            port: 9000,
        })
        .unwrap();
        assert_eq!(rc.bind_addr.to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn relay_config_rejects_bad_host() {
        let fc = RelayFileConfig {
            host: Some("not a host".into()),
            port: 1,
        };
        assert!(RelayConfig::from_file(&fc).is_err());
    }

    #[test]
    fn session_config_from_file() {
        let fc = SessionFileConfig {
            connect_timeout_secs: 30,
            reconnect_delay_secs: 1,
            retention_secs: 10,
            chunk_bytes: 1024,
            download_dir: None,
        };
        let sc = SessionConfig::from_file(
            &fc,
            "ws://localhost:8787/rooms/ABC".into(),
            "p1".into(),
            PathBuf::from("/tmp/dl"),
        );
        assert_eq!(sc.connect_timeout, Duration::from_secs(30));
        assert_eq!(sc.reconnect_delay, Duration::from_secs(1));
        assert_eq!(sc.retention, Duration::from_secs(10));
        assert_eq!(sc.chunk_size, 1024);
        assert_eq!(sc.download_dir, PathBuf::from("/tmp/dl"));
    }

    #[test]
    fn session_config_explicit_download_dir_wins() {
        let fc = SessionFileConfig {
            download_dir: Some(PathBuf::from("/data/incoming")),
            ..Default::default()
        };
        let sc = SessionConfig::from_file(
            &fc,
            "ws://localhost/rooms/X".into(),
            "p1".into(),
            PathBuf::from("/tmp/dl"),
        );
        assert_eq!(sc.download_dir, PathBuf::from("/data/incoming"));
    }

    // ── RoomdropConfig ──────────────────────────────────────────────────

    #[test]
    fn roomdrop_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RoomdropConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(config.data_dir, tmp.path());
        assert_eq!(config.downloads_dir, tmp.path().join("downloads"));
        assert!(tmp.path().join("downloads").exists());
        assert_eq!(config.config_toml_path(), tmp.path().join("config.toml"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.relay.port, 8787);
        assert_eq!(fc.session.retention_secs, 5);
    }

    #[test]
    fn load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[relay]\nhost = \"0.0.0.0\"\nport = 9000\n\n[session]\nretention_secs = 30\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.relay.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(fc.relay.port, 9000);
        assert_eq!(fc.session.retention_secs, 30);
        // Untouched sections keep their defaults.
        assert_eq!(fc.session.chunk_bytes, 64 * 1024);
    }
}
