use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::tunnelgate::relay::{cipher::CipherMode, listener::RelayMode};

const CONFIG_ENV: &str = "TUNNELGATE_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["tunnelgate.toml", "tunnelgate.yaml", "tunnelgate.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Precedence: `--config`, then `TUNNELGATE_CONFIG`, then `tunnelgate.*` in
/// the working directory, then the OS default location.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/tunnelgate/tunnelgate.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "tunnelgate", "tunnelgate")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CONFIG_CANDIDATES[0]))
    }
}

/// Writes the commented default template when `path` does not exist.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match config_ext(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!("config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: Option<GatewayConfig>,
    pub client: Option<ClientConfig>,
    pub relays: Vec<RelayConfig>,
    pub logging: LoggingConfig,
    /// Prometheus exposition address; empty records without exporting.
    pub metrics_addr: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub auth_token: String,
    pub handshake_timeout: Duration,
    pub sink_capacity: usize,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub auth_token: String,
    pub dial_timeout: Duration,
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub address: String,
    pub port: u32,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub upstream: String,
    pub mode: RelayMode,
    pub crypt_key: String,
    pub cipher: CipherMode,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    gateway: Option<FileGateway>,
    client: Option<FileClient>,
    #[serde(default)]
    relays: Vec<FileRelay>,
    logging: Option<FileLogging>,
    metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileGateway {
    listen_addr: String,
    auth_token: Option<String>,
    handshake_timeout_ms: Option<i64>,
    sink_capacity: Option<i64>,
    heartbeat_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    auth_token: Option<String>,
    dial_timeout_ms: Option<i64>,
    #[serde(default)]
    forwards: Vec<FileForward>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileForward {
    #[serde(default)]
    address: String,
    port: i64,
    command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    listen_addr: String,
    upstream: String,
    mode: Option<String>,
    crypt_key: Option<String>,
    cipher: Option<String>,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn trimmed(v: Option<String>) -> String {
    v.unwrap_or_default().trim().to_string()
}

/// Requires a `host:port` (or `:port`) whose port is in 1..=65535.
fn validate_bind_port(field: &str, addr: &str) -> anyhow::Result<()> {
    let Some((_, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("config: {field} {addr:?} missing port");
    };
    match port.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(()),
        _ => anyhow::bail!("config: {field} {addr:?} port must be in 1..=65535"),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            gateway: None,
            client: None,
            relays: vec![],
            logging: LoggingConfig::default(),
            metrics_addr: trimmed(fc.metrics_addr),
        };
        if !cfg.metrics_addr.is_empty() {
            validate_bind_port("metrics_addr", &cfg.metrics_addr)?;
        }

        // --- Gateway ---
        if let Some(g) = fc.gateway {
            let listen_addr = g.listen_addr.trim().to_string();
            validate_bind_port("gateway.listen_addr", &listen_addr)?;
            cfg.gateway = Some(GatewayConfig {
                listen_addr,
                auth_token: trimmed(g.auth_token),
                handshake_timeout: millis(g.handshake_timeout_ms, 10_000),
                sink_capacity: g.sink_capacity.filter(|n| *n > 0).unwrap_or(16) as usize,
                heartbeat_interval: millis(g.heartbeat_interval_ms, 60_000),
            });
        }

        // --- Client ---
        if let Some(c) = fc.client {
            let server_addr = c.server_addr.trim().to_string();
            if server_addr.is_empty() {
                anyhow::bail!("config: client.server_addr is required");
            }

            let mut forwards = Vec::with_capacity(c.forwards.len());
            for (i, f) in c.forwards.into_iter().enumerate() {
                if !(1..=65535).contains(&f.port) {
                    anyhow::bail!("config: client.forwards[{i}] port must be in 1..=65535");
                }
                let command = trimmed(f.command);
                forwards.push(ForwardConfig {
                    address: f.address.trim().to_string(),
                    port: f.port as u32,
                    command: if command.is_empty() { "tcp".into() } else { command },
                });
            }

            cfg.client = Some(ClientConfig {
                server_addr,
                auth_token: trimmed(c.auth_token),
                dial_timeout: millis(c.dial_timeout_ms, 5_000),
                forwards,
            });
        }

        // --- Relays ---
        for (i, r) in fc.relays.into_iter().enumerate() {
            let listen_addr = r.listen_addr.trim().to_string();
            validate_bind_port(&format!("relays[{i}].listen_addr"), &listen_addr)?;

            let upstream = r.upstream.trim().to_string();
            if upstream.is_empty() {
                anyhow::bail!("config: relays[{i}] missing upstream");
            }

            let mode: RelayMode = r
                .mode
                .as_deref()
                .unwrap_or("raw")
                .parse()
                .with_context(|| format!("config: relays[{i}].mode"))?;
            let cipher: CipherMode = r
                .cipher
                .as_deref()
                .unwrap_or("aes-128-gcm")
                .parse()
                .with_context(|| format!("config: relays[{i}].cipher"))?;

            let crypt_key = r.crypt_key.unwrap_or_default();
            if mode != RelayMode::Raw && crypt_key.is_empty() {
                anyhow::bail!("config: relays[{i}] mode {mode} requires crypt_key");
            }

            cfg.relays.push(RelayConfig {
                listen_addr,
                upstream,
                mode,
                crypt_key,
                cipher,
                dial_timeout: millis(r.dial_timeout_ms, 5_000),
            });
        }

        // --- Logging ---
        if let Some(l) = fc.logging {
            if let Some(level) = l.level.filter(|s| !s.trim().is_empty()) {
                cfg.logging.level = level.trim().to_string();
            }
            if let Some(fmt) = l.format.filter(|s| !s.trim().is_empty()) {
                cfg.logging.format = fmt.trim().to_string();
            }
            if let Some(out) = l.output.filter(|s| !s.trim().is_empty()) {
                cfg.logging.output = out.trim().to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        if cfg.gateway.is_none() && cfg.client.is_none() && cfg.relays.is_empty() {
            anyhow::bail!("config: nothing to run (set gateway and/or client and/or relays)");
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tunnelgate configuration.
#
# Enable any combination of [gateway], [client] and [[relays]].

# Serve Prometheus metrics, e.g. ":9100". Empty disables the endpoint.
metrics_addr = ""

[gateway]
# ":PORT" binds on all interfaces.
listen_addr = ":2200"
# Shared secret clients must present. Empty accepts any client.
auth_token = ""
handshake_timeout_ms = 10000
sink_capacity = 16

# [client]
# server_addr = "127.0.0.1:2200"
# auth_token = ""
# dial_timeout_ms = 5000
#
# [[client.forwards]]
# address = "127.0.0.1"
# port = 6000
# command = "tcp -address 127.0.0.1 -port 6000"

# [[relays]]
# listen_addr = ":7000"
# upstream = "127.0.0.1:8000"
# mode = "raw"            # raw | encrypt | decrypt
# crypt_key = ""
# cipher = "aes-128-gcm"  # aes-128-gcm | aes-256-gcm | chacha20-ietf-poly1305

[logging]
level = "info"     # debug | info | warn | error
format = "json"    # json | text
output = "stderr"  # stderr | stdout | discard | <file path>
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tunnelgate configuration.
#
# Enable any combination of gateway, client and relays.

# Serve Prometheus metrics, e.g. ":9100". Empty disables the endpoint.
metrics_addr: ""

gateway:
  # ":PORT" binds on all interfaces.
  listen_addr: ":2200"
  # Shared secret clients must present. Empty accepts any client.
  auth_token: ""
  handshake_timeout_ms: 10000
  sink_capacity: 16

# client:
#   server_addr: "127.0.0.1:2200"
#   auth_token: ""
#   dial_timeout_ms: 5000
#   forwards:
#     - address: "127.0.0.1"
#       port: 6000
#       command: "tcp -address 127.0.0.1 -port 6000"

# relays:
#   - listen_addr: ":7000"
#     upstream: "127.0.0.1:8000"
#     mode: raw             # raw | encrypt | decrypt
#     crypt_key: ""
#     cipher: aes-128-gcm   # aes-128-gcm | aes-256-gcm | chacha20-ietf-poly1305

logging:
  level: info       # debug | info | warn | error
  format: json      # json | text
  output: stderr    # stderr | stdout | discard | <file path>
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("tunnelgate_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn load_str(name: &str, file: &str, body: &str) -> anyhow::Result<Config> {
        let dir = temp_dir(name);
        let path = dir.join(file);
        std::fs::write(&path, body).expect("write");
        let res = load_config(&path);
        let _ = std::fs::remove_dir_all(&dir);
        res
    }

    #[test]
    fn full_toml_config() {
        let cfg = load_str(
            "full",
            "tunnelgate.toml",
            r#"
metrics_addr = ":9100"

[gateway]
listen_addr = ":2200"
auth_token = " s3cret "

[client]
server_addr = "gw.example.com:2200"
dial_timeout_ms = 1500
[[client.forwards]]
address = "127.0.0.1"
port = 6000
command = "tcp -address 127.0.0.1 -port 6000"
[[client.forwards]]
port = 6001

[[relays]]
listen_addr = "127.0.0.1:7000"
upstream = "127.0.0.1:8000"
mode = "encrypt"
crypt_key = "k"
cipher = "chacha20-ietf-poly1305"

[logging]
level = "debug"
format = "text"
"#,
        )
        .expect("load_config");

        let g = cfg.gateway.expect("gateway");
        assert_eq!(g.auth_token, "s3cret");
        assert_eq!(g.handshake_timeout, Duration::from_secs(10));
        assert_eq!(g.sink_capacity, 16);
        assert_eq!(g.heartbeat_interval, Duration::from_secs(60));

        let c = cfg.client.expect("client");
        assert_eq!(c.dial_timeout, Duration::from_millis(1500));
        assert_eq!(c.forwards.len(), 2);
        assert_eq!(c.forwards[1].command, "tcp");

        assert_eq!(cfg.relays[0].mode, RelayMode::Encrypt);
        assert_eq!(cfg.relays[0].cipher, CipherMode::ChaCha20Poly1305);

        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "text");
        assert_eq!(cfg.logging.output, "stderr");
        assert_eq!(cfg.metrics_addr, ":9100");
    }

    #[test]
    fn yaml_config() {
        let cfg = load_str(
            "yaml",
            "tunnelgate.yaml",
            r#"
relays:
  - listen_addr: ":7001"
    upstream: "127.0.0.1:9000"
"#,
        )
        .expect("load_config");
        assert!(cfg.gateway.is_none());
        assert_eq!(cfg.relays[0].mode, RelayMode::Raw);
        assert_eq!(cfg.relays[0].cipher, CipherMode::Aes128Gcm);
    }

    #[test]
    fn validation_errors() {
        let cases = [
            ("empty", "[logging]\nlevel = \"info\"\n", "nothing to run"),
            ("unknown", "[gateway]\nlisten_addr = \":1\"\nbogus = 1\n", "bogus"),
            ("port0", "[gateway]\nlisten_addr = \":0\"\n", "1..=65535"),
            (
                "metrics",
                "metrics_addr = \"localhost\"\n[gateway]\nlisten_addr = \":1\"\n",
                "metrics_addr",
            ),
            ("port_big", "[gateway]\nlisten_addr = \"0.0.0.0:70000\"\n", "1..=65535"),
            (
                "nokey",
                "[[relays]]\nlisten_addr = \":7000\"\nupstream = \"a:1\"\nmode = \"decrypt\"\n",
                "crypt_key",
            ),
            (
                "cipher",
                "[[relays]]\nlisten_addr = \":7000\"\nupstream = \"a:1\"\ncipher = \"rc4-md5\"\n",
                "cipher",
            ),
            (
                "fwd_port",
                "[client]\nserver_addr = \"a:1\"\n[[client.forwards]]\nport = 0\n",
                "forwards[0]",
            ),
        ];

        for (name, body, want) in cases {
            let err = load_str(name, "tunnelgate.toml", body).unwrap_err();
            let msg = format!("{err:#}");
            assert!(msg.contains(want), "{name}: expected {want:?} in {msg}");
        }
    }

    #[test]
    fn created_templates_load() {
        for file in ["tunnelgate.toml", "tunnelgate.yml"] {
            let dir = temp_dir("template");
            let path = dir.join("nested").join(file);

            assert!(ensure_config_file(&path).expect("ensure"));
            assert!(!ensure_config_file(&path).expect("ensure twice"));

            let cfg = load_config(&path).expect("load template");
            let g = cfg.gateway.expect("gateway");
            assert_eq!(g.listen_addr, ":2200");
            assert!(cfg.client.is_none());
            assert!(cfg.relays.is_empty());

            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("tunnelgate.yaml"), "gateway:\n  listen_addr: \":1\"\n").expect("write");

        let resolved = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, dir.join("tunnelgate.yaml"));

        let missing = resolve_config_path(Some(dir.join("custom"))).expect("resolve");
        assert_eq!(missing.path, dir.join("custom.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
