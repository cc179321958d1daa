//! Grammar of the extra command a client sends on a data channel.
//!
//! ```text
//! tcp  [-address <ip|host>] [-port <port|service>]
//! http -domain <domain> [-basic-auth <user>:<pass>]
//! ```
//!
//! Flags take `-name value`, `--name value` or `-name=value`. Parsing stops
//! at the first token that is not a flag.

use std::{collections::HashMap, fmt, net::IpAddr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unsupported command {0:?} (only tcp/http)")]
    UnsupportedKind(String),
    #[error("invalid http command: missing arguments")]
    MissingHttpArgs,
    #[error("flag provided but not defined: {0}")]
    UnknownFlag(String),
    #[error("flag needs an argument: {0}")]
    MissingValue(String),
    #[error("bad flag syntax: {0}")]
    BadFlagSyntax(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no address found for {0}")]
    NoAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Tcp,
    Http,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Http => "http",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraCommand {
    pub kind: ProxyKind,
    pub address: String,
    pub port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpCommand {
    /// Resolved IP, or empty when no address was given.
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpCommand {
    pub domain: String,
    pub basic_auth_user: String,
    pub basic_auth_pass: String,
}

pub async fn parse_extra_command(s: &str) -> Result<ExtraCommand, CommandError> {
    tracing::debug!(command = %s, "gateway: parse extra command");

    let tokens: Vec<&str> = s.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return if s.is_empty() {
            Err(CommandError::Empty)
        } else {
            Err(CommandError::UnsupportedKind(String::new()))
        };
    };

    match *first {
        "tcp" => {
            let cmd = parse_tcp_command(&tokens).await?;
            Ok(ExtraCommand {
                kind: ProxyKind::Tcp,
                address: cmd.address,
                port: u32::from(cmd.port),
            })
        }
        "http" => {
            let cmd = parse_http_command(&tokens)?;
            tracing::debug!(domain = %cmd.domain, "gateway: http command parsed");
            Ok(ExtraCommand {
                kind: ProxyKind::Http,
                address: String::new(),
                port: 0,
            })
        }
        other => Err(CommandError::UnsupportedKind(other.to_string())),
    }
}

pub async fn parse_tcp_command(tokens: &[&str]) -> Result<TcpCommand, CommandError> {
    match tokens.first() {
        Some(&"tcp") => {}
        Some(other) => return Err(CommandError::UnsupportedKind(other.to_string())),
        None => return Err(CommandError::Empty),
    }
    if tokens.len() == 1 {
        return Ok(TcpCommand::default());
    }

    let flags = parse_flags(&tokens[1..], &["address", "port"])?;
    let address = flags.get("address").map(String::as_str).unwrap_or("");
    let port = flags.get("port").map(String::as_str).unwrap_or("");

    // Port first: a bad port never costs a DNS round trip.
    let port = lookup_port(port)?;
    let address = resolve_ip(address).await?;
    Ok(TcpCommand { address, port })
}

pub fn parse_http_command(tokens: &[&str]) -> Result<HttpCommand, CommandError> {
    if tokens.len() < 2 {
        return Err(CommandError::MissingHttpArgs);
    }

    // Flags start right after the kind: `http -domain` lacks a value and
    // `http foo -x` stops at `foo`.
    let flags = parse_flags(&tokens[1..], &["domain", "basic-auth"])?;
    let mut cmd = HttpCommand {
        domain: flags.get("domain").cloned().unwrap_or_default(),
        ..Default::default()
    };
    if let Some(auth) = flags.get("basic-auth").filter(|v| !v.is_empty()) {
        match auth.split_once(':') {
            Some((user, pass)) => {
                cmd.basic_auth_user = user.to_string();
                cmd.basic_auth_pass = pass.to_string();
            }
            None => cmd.basic_auth_user = auth.clone(),
        }
    }
    Ok(cmd)
}

fn parse_flags(args: &[&str], known: &[&str]) -> Result<HashMap<String, String>, CommandError> {
    let mut out = HashMap::new();
    let mut i = 0;

    while i < args.len() {
        let arg = args[i];
        if arg.len() < 2 || !arg.starts_with('-') {
            break;
        }
        let mut name = &arg[1..];
        if let Some(rest) = name.strip_prefix('-') {
            if rest.is_empty() {
                // "--" ends the flags.
                break;
            }
            name = rest;
        }
        if name.starts_with('-') || name.starts_with('=') {
            return Err(CommandError::BadFlagSyntax(arg.to_string()));
        }
        i += 1;

        let (name, inline) = match name.split_once('=') {
            Some((n, v)) => (n, Some(v.to_string())),
            None => (name, None),
        };
        if !known.contains(&name) {
            if name == "h" || name == "help" {
                break;
            }
            return Err(CommandError::UnknownFlag(name.to_string()));
        }

        let value = match inline {
            Some(v) => v,
            None => {
                let Some(v) = args.get(i) else {
                    return Err(CommandError::MissingValue(name.to_string()));
                };
                i += 1;
                v.to_string()
            }
        };
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

const WELL_KNOWN_TCP: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ftps", 990),
    ("gopher", 70),
    ("http", 80),
    ("https", 443),
    ("imap2", 143),
    ("imap3", 220),
    ("imaps", 993),
    ("pop3", 110),
    ("pop3s", 995),
    ("smtp", 25),
    ("submissions", 465),
    ("ssh", 22),
    ("telnet", 23),
];

/// Accepts a decimal port or a well-known service name; empty means 0.
///
/// Service names come only from `WELL_KNOWN_TCP`; the system services
/// database is not consulted, so names like `mysql` are rejected.
pub fn lookup_port(s: &str) -> Result<u16, CommandError> {
    if s.is_empty() {
        return Ok(0);
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<u16>().map_err(|_| CommandError::InvalidPort(s.to_string()));
    }
    let lower = s.to_ascii_lowercase();
    WELL_KNOWN_TCP
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, port)| *port)
        .ok_or_else(|| CommandError::InvalidPort(s.to_string()))
}

/// Resolves `address` to an IP string, preferring IPv4 for host names.
pub async fn resolve_ip(address: &str) -> Result<String, CommandError> {
    if address.is_empty() {
        return Ok(String::new());
    }
    let literal = address.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host((address, 0u16))
        .await
        .map_err(|source| CommandError::Resolve {
            address: address.to_string(),
            source,
        })?
        .map(|sa| sa.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .map(IpAddr::to_string)
        .ok_or_else(|| CommandError::NoAddress(address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_with_address_and_port() {
        let cmd = parse_extra_command("tcp -address 10.0.0.5 -port 6000").await.unwrap();
        assert_eq!(
            cmd,
            ExtraCommand {
                kind: ProxyKind::Tcp,
                address: "10.0.0.5".into(),
                port: 6000,
            }
        );
    }

    #[tokio::test]
    async fn bare_tcp_is_valid() {
        let cmd = parse_extra_command("tcp").await.unwrap();
        assert_eq!(cmd.kind, ProxyKind::Tcp);
        assert_eq!(cmd.address, "");
        assert_eq!(cmd.port, 0);
    }

    #[tokio::test]
    async fn out_of_range_port_fails_before_resolution() {
        let err = parse_extra_command("tcp -address not-an-ip -port 70000")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPort(p) if p == "70000"));
    }

    #[tokio::test]
    async fn flag_spellings_and_service_names() {
        let cmd = parse_extra_command("tcp --address=127.0.0.1 --port ssh").await.unwrap();
        assert_eq!(cmd.address, "127.0.0.1");
        assert_eq!(cmd.port, 22);

        let cmd = parse_extra_command("tcp -port=443 trailing -address 10.9.9.9")
            .await
            .unwrap();
        assert_eq!(cmd.address, "");
        assert_eq!(cmd.port, 443);
    }

    #[tokio::test]
    async fn localhost_resolves_to_a_loopback_ip() {
        let cmd = parse_extra_command("tcp -address localhost -port 80").await.unwrap();
        let ip: IpAddr = cmd.address.parse().unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn flag_errors() {
        let err = parse_extra_command("tcp -bogus 1").await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownFlag(f) if f == "bogus"));

        let err = parse_extra_command("tcp -port").await.unwrap_err();
        assert!(matches!(err, CommandError::MissingValue(f) if f == "port"));

        let err = parse_extra_command("tcp ---port 1").await.unwrap_err();
        assert!(matches!(err, CommandError::BadFlagSyntax(_)));

        // help stops parsing without an error
        let cmd = parse_extra_command("tcp -port 25 -h -bogus").await.unwrap();
        assert_eq!(cmd.port, 25);
    }

    #[tokio::test]
    async fn http_command_is_parsed() {
        let cmd = parse_extra_command("http -domain test.example.com -basic-auth alice:secret")
            .await
            .unwrap();
        assert_eq!(cmd.kind, ProxyKind::Http);

        let tokens = ["http", "-domain", "test.example.com", "-basic-auth", "alice:s:e"];
        let http = parse_http_command(&tokens).unwrap();
        assert_eq!(http.domain, "test.example.com");
        assert_eq!(http.basic_auth_user, "alice");
        assert_eq!(http.basic_auth_pass, "s:e");

        assert!(matches!(
            parse_extra_command("http").await,
            Err(CommandError::MissingHttpArgs)
        ));
    }

    #[test]
    fn http_flags_start_after_the_kind() {
        assert!(matches!(
            parse_http_command(&["http", "-domain"]),
            Err(CommandError::MissingValue(f)) if f == "domain"
        ));

        let http = parse_http_command(&["http", "foo", "-unknown"]).unwrap();
        assert_eq!(http, HttpCommand::default());
    }

    #[tokio::test]
    async fn unsupported_or_empty_input() {
        assert!(matches!(parse_extra_command("").await, Err(CommandError::Empty)));
        assert!(matches!(
            parse_extra_command("   ").await,
            Err(CommandError::UnsupportedKind(_))
        ));
        assert!(matches!(
            parse_extra_command("udp -port 53").await,
            Err(CommandError::UnsupportedKind(k)) if k == "udp"
        ));
    }

    #[test]
    fn port_lookup() {
        assert_eq!(lookup_port("").unwrap(), 0);
        assert_eq!(lookup_port("65535").unwrap(), 65535);
        assert_eq!(lookup_port("HTTPS").unwrap(), 443);
        assert!(lookup_port("65536").is_err());
        assert!(lookup_port("-1").is_err());
        assert!(lookup_port("no-such-service").is_err());
        assert!(matches!(lookup_port("mysql"), Err(CommandError::InvalidPort(p)) if p == "mysql"));
    }
}
