use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `SLOTBAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name that resolves to the administrator role.
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub retention_days: i64,
    pub booking_horizon_days: i64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "slotbay".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            retention_days: 30,
            booking_horizon_days: 30,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            bind: lookup("SLOTBAY_BIND").unwrap_or(defaults.bind),
            port: parse_or(lookup("SLOTBAY_PORT"), defaults.port),
            data_dir: lookup("SLOTBAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("SLOTBAY_PASSWORD").unwrap_or(defaults.password),
            admin_user: lookup("SLOTBAY_ADMIN_USER").unwrap_or(defaults.admin_user),
            max_connections: parse_or(lookup("SLOTBAY_MAX_CONNECTIONS"), defaults.max_connections),
            compact_threshold: parse_or(lookup("SLOTBAY_COMPACT_THRESHOLD"), defaults.compact_threshold),
            retention_days: parse_or(lookup("SLOTBAY_RETENTION_DAYS"), defaults.retention_days),
            booking_horizon_days: parse_or(
                lookup("SLOTBAY_BOOKING_HORIZON_DAYS"),
                defaults.booking_horizon_days,
            ),
            metrics_port: lookup("SLOTBAY_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("SLOTBAY_TLS_CERT"),
            tls_key: lookup("SLOTBAY_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbay.wal")
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.parse().ok()).unwrap_or(default)
}
