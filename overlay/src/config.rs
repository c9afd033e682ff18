//! Configuration (ambient, §4.O): `DaemonConfig` (peer binary) and
//! `RelayConfig` (relay binary), TOML-deserialized with `#[serde(default)]`
//! everywhere a sane default exists, validated once at start-up so an
//! operator who supplies no config file at all still gets a fully working
//! node.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::relay::{CircuitLimits, ReservationLimits};

fn default_namespace() -> String {
    "overlay".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("overlay")
}

fn default_identity_path() -> PathBuf {
    default_state_dir().join("identity.key")
}

fn default_authorized_keys_path() -> PathBuf {
    default_state_dir().join("authorized_keys")
}

fn default_control_socket_path() -> PathBuf {
    default_state_dir().join("control.sock")
}

fn default_admin_socket_path() -> PathBuf {
    default_state_dir().join("admin.sock")
}

fn default_vault_path() -> PathBuf {
    default_state_dir().join("vault.json")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Daemon (peer node) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Operator-chosen label embedded in protocol ids, segregating
    /// otherwise-identical private overlays from one another.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,

    #[serde(default = "default_control_socket_path")]
    pub control_socket_path: PathBuf,

    /// Relays this daemon may race a path dial against, in priority order.
    #[serde(default)]
    pub relays: Vec<String>,

    /// Maximum attempts for `DialWithRetry` (component I).
    #[serde(default = "default_max_attempts")]
    pub dial_max_attempts: u32,

    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// A service the daemon exposes on start-up, as read from config (the
/// control API's `/expose` endpoint adds to the same registry at runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub local_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_override: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            identity_path: default_identity_path(),
            authorized_keys_path: default_authorized_keys_path(),
            control_socket_path: default_control_socket_path(),
            relays: Vec::new(),
            dial_max_attempts: default_max_attempts(),
            services: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate ranges and well-formedness. Start-up validation failures are
    /// fatal *Configuration* errors (§7); this never mutates state.
    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace)?;
        if self.dial_max_attempts == 0 {
            anyhow::bail!("dial_max_attempts must be at least 1");
        }
        for service in &self.services {
            validate_service_name(&service.name)?;
        }
        Ok(())
    }
}

/// Relay (gatekeeping circuit relay) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,

    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: PathBuf,

    #[serde(default = "default_admin_socket_path")]
    pub admin_socket_path: PathBuf,

    #[serde(default = "default_vault_path")]
    pub vault_path: PathBuf,

    #[serde(default)]
    pub reservation: ReservationConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Minutes of unsealed idle time before the vault auto-seals itself.
    /// `None` disables auto-seal.
    #[serde(default)]
    pub auto_seal_mins: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            identity_path: default_identity_path(),
            authorized_keys_path: default_authorized_keys_path(),
            admin_socket_path: default_admin_socket_path(),
            vault_path: default_vault_path(),
            reservation: ReservationConfig::default(),
            circuit: CircuitConfig::default(),
            auto_seal_mins: Some(60),
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace)?;
        self.reservation.validate()?;
        self.circuit.validate()?;
        Ok(())
    }

    pub fn reservation_limits(&self) -> ReservationLimits {
        ReservationLimits {
            max_per_peer: self.reservation.max_per_peer,
            max_per_ip: self.reservation.max_per_ip,
            max_per_asn: self.reservation.max_per_asn,
            max_reservations: self.reservation.max_reservations,
            reservation_ttl: Duration::from_secs(self.reservation.reservation_ttl_secs),
        }
    }

    pub fn circuit_limits(&self) -> CircuitLimits {
        CircuitLimits {
            max_circuits: self.circuit.max_circuits,
            session_duration: Duration::from_secs(self.circuit.session_duration_secs),
            session_data_limit: self.circuit.session_data_limit_bytes,
            buffer_size: self.circuit.buffer_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    #[serde(default = "default_max_per_peer")]
    pub max_per_peer: u32,
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: u32,
    #[serde(default = "default_max_per_asn")]
    pub max_per_asn: u32,
    #[serde(default = "default_max_reservations")]
    pub max_reservations: u32,
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
}

fn default_max_per_peer() -> u32 {
    1
}
fn default_max_per_ip() -> u32 {
    4
}
fn default_max_per_asn() -> u32 {
    16
}
fn default_max_reservations() -> u32 {
    128
}
fn default_reservation_ttl_secs() -> u64 {
    3600
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_per_peer: default_max_per_peer(),
            max_per_ip: default_max_per_ip(),
            max_per_asn: default_max_per_asn(),
            max_reservations: default_max_reservations(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
        }
    }
}

impl ReservationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_per_peer == 0 {
            anyhow::bail!("reservation.max_per_peer must be at least 1");
        }
        if self.max_reservations == 0 {
            anyhow::bail!("reservation.max_reservations must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_max_circuits")]
    pub max_circuits: u32,
    #[serde(default = "default_session_duration_secs")]
    pub session_duration_secs: u64,
    #[serde(default = "default_session_data_limit_bytes")]
    pub session_data_limit_bytes: u64,
    #[serde(default = "default_buffer_size_bytes")]
    pub buffer_size_bytes: usize,
}

fn default_max_circuits() -> u32 {
    512
}
fn default_session_duration_secs() -> u64 {
    600
}
fn default_session_data_limit_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_buffer_size_bytes() -> usize {
    16 * 1024
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_circuits: default_max_circuits(),
            session_duration_secs: default_session_duration_secs(),
            session_data_limit_bytes: default_session_data_limit_bytes(),
            buffer_size_bytes: default_buffer_size_bytes(),
        }
    }
}

impl CircuitConfig {
    fn validate(&self) -> Result<()> {
        if self.max_circuits == 0 {
            anyhow::bail!("circuit.max_circuits must be at least 1");
        }
        if self.session_data_limit_bytes == 0 {
            anyhow::bail!("circuit.session_data_limit_bytes must be at least 1");
        }
        Ok(())
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let well_formed = !namespace.is_empty()
        && namespace.len() <= 64
        && namespace
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !well_formed {
        anyhow::bail!("namespace '{namespace}' must be 1-64 ASCII alphanumeric/-/_ characters");
    }
    Ok(())
}

/// Mirrors the DNS-label rule component J applies to service names:
/// 1-63 lowercase alphanumeric and hyphen, not hyphen-bounded.
fn validate_service_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !ok {
        anyhow::bail!("service name '{name}' is not a valid DNS label");
    }
    Ok(())
}

/// Whether the default-enabled umask discipline (§4.K/§4.L) should run
/// during socket bind. Always true outside tests; kept as a function (not a
/// constant) so a future platform-specific override has somewhere to live.
pub fn umask_during_bind_enabled() -> bool {
    default_true()
}
