//! Service configuration.
//!
//! Sourced from `COSE_*` environment variables, with an optional JSON config
//! file (`COSE_CONFIG`) overriding individual options. Mandatory options are
//! checked after both sources are applied; a configuration failure is fatal
//! at startup.
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroizing;

const SECRET_LEN: usize = 32;

const DEFAULT_ENV: &str = "prod";
const DEFAULT_TCP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9100";
const DEFAULT_TLS_CERT_FILE: &str = "cert.pem";
const DEFAULT_TLS_KEY_FILE: &str = "key.pem";
const DEFAULT_CSR_COUNTRY: &str = "DE";
const DEFAULT_CSR_ORGANIZATION: &str = "COSE signing service";

const DEFAULT_DB_MAX_OPEN_CONNS: u32 = 10;
const DEFAULT_DB_MAX_IDLE_CONNS: u32 = 10;
const DEFAULT_DB_CONN_MAX_LIFETIME_MIN: u64 = 10;
const DEFAULT_DB_CONN_MAX_IDLE_TIME_MIN: u64 = 1;

/// Connection-pool tuning for the durable store.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub dsn: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Decoded 32-byte key-encryption secret; wiped on drop.
    pub secret: Zeroizing<Vec<u8>>,
    /// Bearer token required for `PUT /register`.
    pub register_auth: String,
    /// Backend stage (`dev` | `demo` | `prod`); selects default service URLs.
    pub env: String,
    /// Durable store; absent means the non-durable in-memory fallback.
    pub postgres: Option<PostgresConfig>,
    pub tcp_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    /// TLS options are recognized for the deployment's terminator; this
    /// process serves plain HTTP.
    pub tls: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub csr_country: String,
    pub csr_organization: String,
    pub certificate_server: String,
    pub certificate_server_pubkey: String,
    pub reload_certs_every_minute: bool,
    pub key_service: String,
    pub identity_service: String,
    /// Identities to initialize at first startup (uuid → auth token).
    pub tokens: HashMap<Uuid, String>,
}

/// JSON config file shape; every field optional, present values override the
/// environment.
#[derive(Debug, Deserialize)]
struct ConfigFileOverride {
    secret32: Option<String>,
    #[serde(rename = "registerAuth")]
    register_auth: Option<String>,
    env: Option<String>,
    #[serde(rename = "postgresDSN")]
    postgres_dsn: Option<String>,
    #[serde(rename = "dbMaxOpenConns")]
    db_max_open_conns: Option<u32>,
    #[serde(rename = "dbMaxIdleConns")]
    db_max_idle_conns: Option<u32>,
    #[serde(rename = "dbConnMaxLifetime")]
    db_conn_max_lifetime: Option<u64>,
    #[serde(rename = "dbConnMaxIdleTime")]
    db_conn_max_idle_time: Option<u64>,
    #[serde(rename = "TCP_addr")]
    tcp_addr: Option<String>,
    #[serde(rename = "metricsAddr")]
    metrics_addr: Option<String>,
    #[serde(rename = "TLS")]
    tls: Option<bool>,
    #[serde(rename = "TLSCertFile")]
    tls_cert_file: Option<String>,
    #[serde(rename = "TLSKeyFile")]
    tls_key_file: Option<String>,
    #[serde(rename = "CSR_country")]
    csr_country: Option<String>,
    #[serde(rename = "CSR_organization")]
    csr_organization: Option<String>,
    #[serde(rename = "certificateServer")]
    certificate_server: Option<String>,
    #[serde(rename = "certificateServerPubKey")]
    certificate_server_pubkey: Option<String>,
    #[serde(rename = "reloadCertsEveryMinute")]
    reload_certs_every_minute: Option<bool>,
    #[serde(rename = "keyService")]
    key_service: Option<String>,
    #[serde(rename = "identityService")]
    identity_service: Option<String>,
    tokens: Option<HashMap<Uuid, String>>,
}

/// Raw option values before validation and default derivation.
#[derive(Debug, Default)]
struct Loader {
    secret_base64: String,
    register_auth: String,
    env: String,
    postgres_dsn: String,
    db_max_open_conns: u32,
    db_max_idle_conns: u32,
    db_conn_max_lifetime_min: u64,
    db_conn_max_idle_time_min: u64,
    tcp_addr: String,
    metrics_addr: String,
    tls: bool,
    tls_cert_file: String,
    tls_key_file: String,
    csr_country: String,
    csr_organization: String,
    certificate_server: String,
    certificate_server_pubkey: String,
    reload_certs_every_minute: bool,
    key_service: String,
    identity_service: String,
    tokens: HashMap<Uuid, String>,
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str) -> Result<bool> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("parse {name} as bool")),
        Err(_) => Ok(false),
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("parse {name} as number")),
        Err(_) => Ok(default),
    }
}

impl Loader {
    fn from_env() -> Result<Self> {
        Ok(Self {
            secret_base64: env_string("COSE_SECRET32", ""),
            register_auth: env_string("COSE_REGISTER_AUTH", ""),
            env: env_string("COSE_ENV", DEFAULT_ENV),
            postgres_dsn: env_string("COSE_POSTGRES_DSN", ""),
            db_max_open_conns: env_number("COSE_DB_MAX_OPEN_CONNS", DEFAULT_DB_MAX_OPEN_CONNS)?,
            db_max_idle_conns: env_number("COSE_DB_MAX_IDLE_CONNS", DEFAULT_DB_MAX_IDLE_CONNS)?,
            db_conn_max_lifetime_min: env_number(
                "COSE_DB_CONN_MAX_LIFETIME",
                DEFAULT_DB_CONN_MAX_LIFETIME_MIN,
            )?,
            db_conn_max_idle_time_min: env_number(
                "COSE_DB_CONN_MAX_IDLE_TIME",
                DEFAULT_DB_CONN_MAX_IDLE_TIME_MIN,
            )?,
            tcp_addr: env_string("COSE_TCP_ADDR", DEFAULT_TCP_ADDR),
            metrics_addr: env_string("COSE_METRICS_ADDR", DEFAULT_METRICS_ADDR),
            tls: env_bool("COSE_TLS")?,
            tls_cert_file: env_string("COSE_TLS_CERT_FILE", DEFAULT_TLS_CERT_FILE),
            tls_key_file: env_string("COSE_TLS_KEY_FILE", DEFAULT_TLS_KEY_FILE),
            csr_country: env_string("COSE_CSR_COUNTRY", DEFAULT_CSR_COUNTRY),
            csr_organization: env_string("COSE_CSR_ORGANIZATION", DEFAULT_CSR_ORGANIZATION),
            certificate_server: env_string("COSE_CERTIFICATE_SERVER", ""),
            certificate_server_pubkey: env_string("COSE_CERTIFICATE_SERVER_PUBKEY", ""),
            reload_certs_every_minute: env_bool("COSE_RELOAD_CERTS_EVERY_MINUTE")?,
            key_service: env_string("COSE_KEY_SERVICE", ""),
            identity_service: env_string("COSE_IDENTITY_SERVICE", ""),
            tokens: HashMap::new(),
        })
    }

    fn apply_file(&mut self, path: &str) -> Result<()> {
        tracing::info!(path, "loading configuration file");
        let contents =
            fs::read_to_string(path).with_context(|| format!("read COSE_CONFIG: {path}"))?;
        let file: ConfigFileOverride =
            serde_json::from_str(&contents).with_context(|| "parse configuration file")?;

        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = file.$field {
                    self.$field = value;
                }
            };
        }
        if let Some(value) = file.secret32 {
            self.secret_base64 = value;
        }
        take!(register_auth);
        take!(env);
        take!(postgres_dsn);
        take!(db_max_open_conns);
        take!(db_max_idle_conns);
        if let Some(value) = file.db_conn_max_lifetime {
            self.db_conn_max_lifetime_min = value;
        }
        if let Some(value) = file.db_conn_max_idle_time {
            self.db_conn_max_idle_time_min = value;
        }
        take!(tcp_addr);
        take!(metrics_addr);
        take!(tls);
        take!(tls_cert_file);
        take!(tls_key_file);
        take!(csr_country);
        take!(csr_organization);
        take!(certificate_server);
        take!(certificate_server_pubkey);
        take!(reload_certs_every_minute);
        take!(key_service);
        take!(identity_service);
        take!(tokens);
        Ok(())
    }

    fn finish(self) -> Result<Config> {
        let secret = Zeroizing::new(
            BASE64
                .decode(&self.secret_base64)
                .with_context(|| "unable to decode base64 encoded secret ('secret32')")?,
        );
        if secret.len() != SECRET_LEN {
            bail!(
                "secret for key encryption ('secret32') must be {SECRET_LEN} bytes, got {}",
                secret.len()
            );
        }
        if self.register_auth.is_empty() {
            bail!("auth token for identity registration ('registerAuth') wasn't set");
        }
        if self.certificate_server.is_empty() {
            bail!("missing 'certificateServer' in configuration");
        }
        if self.certificate_server_pubkey.is_empty() {
            bail!("missing 'certificateServerPubKey' in configuration");
        }

        let mut seen_tokens = HashSet::new();
        for (uid, token) in &self.tokens {
            if token.is_empty() {
                bail!("{uid}: empty auth token");
            }
            if !seen_tokens.insert(token.as_str()) {
                bail!("{uid}: can not use same token for multiple identities");
            }
        }

        let postgres = if self.postgres_dsn.is_empty() {
            None
        } else {
            Some(PostgresConfig {
                dsn: self.postgres_dsn,
                max_open_conns: self.db_max_open_conns,
                max_idle_conns: self.db_max_idle_conns,
                conn_max_lifetime: Duration::from_secs(self.db_conn_max_lifetime_min * 60),
                conn_max_idle_time: Duration::from_secs(self.db_conn_max_idle_time_min * 60),
            })
        };

        let env = self.env;
        let key_service = if self.key_service.is_empty() {
            format!("https://identity.{env}.example.com/api/keyService/v1/pubkey")
        } else {
            self.key_service
        };
        let identity_service = if self.identity_service.is_empty() {
            format!("https://identity.{env}.example.com/api/certs/v1/csr/register")
        } else {
            self.identity_service
        };

        Ok(Config {
            secret,
            register_auth: self.register_auth,
            env,
            postgres,
            tcp_addr: self
                .tcp_addr
                .parse()
                .with_context(|| "parse TCP_addr as socket address")?,
            metrics_addr: self
                .metrics_addr
                .parse()
                .with_context(|| "parse metricsAddr as socket address")?,
            tls: self.tls,
            tls_cert_file: self.tls_cert_file,
            tls_key_file: self.tls_key_file,
            csr_country: self.csr_country,
            csr_organization: self.csr_organization,
            certificate_server: self.certificate_server,
            certificate_server_pubkey: self.certificate_server_pubkey,
            reload_certs_every_minute: self.reload_certs_every_minute,
            key_service,
            identity_service,
            tokens: self.tokens,
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Loader::from_env()?.finish()
    }

    pub fn from_env_or_file() -> Result<Self> {
        let mut loader = Loader::from_env()?;
        if let Ok(path) = std::env::var("COSE_CONFIG") {
            loader.apply_file(&path)?;
        }
        loader.finish()
    }
}
