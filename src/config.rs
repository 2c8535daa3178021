use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "nettrap: low-interaction async honeypot")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(long, default_value = "./nettrap.conf")]
    pub config: PathBuf,

    /// Backend URL to POST events to (overrides config)
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Backend bearer token for authenticated POSTs
    #[arg(long)]
    pub backend_token: Option<String>,

    /// List configured services and exit
    #[arg(long)]
    pub list_services: bool,

    /// Tracing filter, e.g. "info" or "nettrap=debug"
    #[arg(long)]
    pub log_filter: Option<String>,
}

/// The closed set of service kinds this honeypot can stand up. Selection
/// happens at configuration-load time; an unknown name is a load error, not
/// a runtime warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceKind {
    Ftp,
    Http,
    Ssh,
    Dns,
    Vnc,
    Mysql,
    Postgres,
    Ldap,
    Telnet,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized service '{0}'")]
    UnrecognizedService(String),
}

impl FromStr for ServiceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "ftp" => Ok(Self::Ftp),
            "http" => Ok(Self::Http),
            "ssh" => Ok(Self::Ssh),
            "dns" => Ok(Self::Dns),
            "vnc" => Ok(Self::Vnc),
            "mysql" => Ok(Self::Mysql),
            "postgres" => Ok(Self::Postgres),
            "ldap" => Ok(Self::Ldap),
            "telnet" => Ok(Self::Telnet),
            other => Err(ConfigError::UnrecognizedService(other.to_string())),
        }
    }
}

impl ServiceKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ftp => "ftp",
            Self::Http => "http",
            Self::Ssh => "ssh",
            Self::Dns => "dns",
            Self::Vnc => "vnc",
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Ldap => "ldap",
            Self::Telnet => "telnet",
        }
    }
}

/// One configured service instance. Read-only to the server and handlers.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub port: u16,
    /// Upstream resolver for the DNS proxy, "ip:port".
    pub upstream: Option<SocketAddr>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub banner: Option<String>,
}

impl ServiceConfig {
    pub fn on_port(port: u16) -> Self {
        Self {
            port,
            upstream: None,
            username: None,
            password: None,
            banner: None,
        }
    }

    pub fn with_upstream(mut self, upstream: SocketAddr) -> Self {
        self.upstream = Some(upstream);
        self
    }
}

#[derive(Deserialize, Debug)]
pub struct FileConfig {
    pub id: Option<String>,
    pub listen_addr: Option<IpAddr>,
    pub backend_url: Option<String>,
    pub backend_token: Option<String>,
    pub report_interval_seconds: Option<u64>,
    pub services: Option<BTreeMap<String, Vec<ServiceConfig>>>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub sensor_id: String,
    pub listen_addr: IpAddr,
    pub backend_url: Option<String>,
    pub backend_token: Option<String>,
    pub report_interval_seconds: u64,
    pub services: Vec<(ServiceKind, ServiceConfig)>,
}

const DEFAULT_CONFIG: &str = r#"{
    "id": "",
    "listen_addr": "0.0.0.0",
    "backend_url": null,
    "report_interval_seconds": 60,
    "services": {
        "ftp": [{ "port": 21 }],
        "ssh": [{ "port": 22 }],
        "http": [{ "port": 8080 }],
        "dns": [{ "port": 5353, "upstream": "127.0.0.1:53" }]
    }
}
"#;

/// Resolves the config file's service map into the closed kind set.
pub fn resolve_services(
    services: &BTreeMap<String, Vec<ServiceConfig>>,
) -> Result<Vec<(ServiceKind, ServiceConfig)>, ConfigError> {
    let mut resolved = Vec::new();
    for (name, instances) in services {
        let kind = ServiceKind::from_str(name)?;
        for service in instances {
            resolved.push((kind, service.clone()));
        }
    }
    Ok(resolved)
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        // Explicit or default path; seed a commented template on first run.
        let file_cfg: FileConfig = if cli.config.exists() {
            let s = fs::read_to_string(&cli.config)
                .with_context(|| format!("reading config {}", cli.config.display()))?;
            serde_json::from_str(&s).with_context(|| "parsing config file")?
        } else {
            let _ = fs::write(&cli.config, DEFAULT_CONFIG);
            serde_json::from_str(DEFAULT_CONFIG).context("parsing built-in default config")?
        };

        let sensor_id = match file_cfg.id {
            Some(id) if !id.is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };

        let backend_url = cli
            .backend_url
            .clone()
            .or(file_cfg.backend_url)
            .filter(|u| !u.is_empty());
        let backend_token = cli.backend_token.clone().or(file_cfg.backend_token);

        let services = resolve_services(&file_cfg.services.unwrap_or_default())?;

        Ok(Config {
            sensor_id,
            listen_addr: file_cfg
                .listen_addr
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            backend_url,
            backend_token,
            report_interval_seconds: file_cfg.report_interval_seconds.unwrap_or(60),
            services,
        })
    }
}

// Internal convenience builder (exposed for integration tests)
impl Config {
    pub fn test_builder() -> TestConfigBuilder {
        TestConfigBuilder::default()
    }
}

#[derive(Default)]
#[doc(hidden)]
pub struct TestConfigBuilder {
    sensor_id: Option<String>,
    listen_addr: Option<IpAddr>,
    backend_url: Option<String>,
    backend_token: Option<String>,
    report_interval_seconds: Option<u64>,
    services: Vec<(ServiceKind, ServiceConfig)>,
}

impl TestConfigBuilder {
    pub fn sensor_id<S: Into<String>>(mut self, s: S) -> Self {
        self.sensor_id = Some(s.into());
        self
    }

    pub fn listen_addr(mut self, ip: IpAddr) -> Self {
        self.listen_addr = Some(ip);
        self
    }

    pub fn backend_url(mut self, v: Option<String>) -> Self {
        self.backend_url = v;
        self
    }

    pub fn backend_token(mut self, v: Option<String>) -> Self {
        self.backend_token = v;
        self
    }

    pub fn report_interval_seconds(mut self, v: u64) -> Self {
        self.report_interval_seconds = Some(v);
        self
    }

    pub fn service(mut self, kind: ServiceKind, service: ServiceConfig) -> Self {
        self.services.push((kind, service));
        self
    }

    pub fn build(self) -> Config {
        Config {
            sensor_id: self.sensor_id.unwrap_or_else(|| "test-sensor".into()),
            listen_addr: self.listen_addr.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            backend_url: self.backend_url,
            backend_token: self.backend_token,
            report_interval_seconds: self.report_interval_seconds.unwrap_or(30),
            services: self.services,
        }
    }
}
