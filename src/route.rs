//! Virtual host and location resolution.
//!
//! Given the `Host` header and a normalized path, produce the effective
//! directive set: server-level directives overridden by those of the best
//! matching location.

use std::path::PathBuf;

use anyhow::Context;
use regex::{Regex, RegexBuilder};

use crate::config::{Directives, ServerConfig};
use crate::http::request::Method;
use crate::http::response::StatusCode;

/// Resolves a request to its effective configuration.
pub trait Resolve {
    fn resolve(&self, host: Option<&str>, path: &str) -> EffectiveConfig;
}

enum NameMatch {
    Exact(String),
    /// `*.example.com`, stored as `.example.com`.
    Leading(String),
    /// `www.example.*`, stored as `www.example.`.
    Trailing(String),
    Pattern(Regex),
}

enum LocationMatch {
    Exact(String),
    /// `^~` prefix: wins over regex locations when it is the longest prefix.
    Priority(String),
    Pattern(Regex),
    Prefix(String),
}

struct Location {
    pattern: String,
    matcher: LocationMatch,
    directives: Directives,
}

struct VirtualServer {
    names: Vec<NameMatch>,
    directives: Directives,
    locations: Vec<Location>,
}

/// The servers sharing one listen address. The first one is the default.
pub struct VirtualHosts {
    servers: Vec<VirtualServer>,
}

impl VirtualHosts {
    pub fn new(servers: &[ServerConfig]) -> anyhow::Result<Self> {
        let servers = servers
            .iter()
            .map(VirtualServer::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        if servers.is_empty() {
            anyhow::bail!("no server for this listen address");
        }
        Ok(Self { servers })
    }

    fn select_server(&self, host: Option<&str>) -> &VirtualServer {
        let default = &self.servers[0];
        let Some(host) = host.map(strip_port) else {
            return default;
        };
        let host = host.to_ascii_lowercase();

        let all = || self.servers.iter().flat_map(|s| s.names.iter().map(move |n| (s, n)));

        if let Some((server, _)) = all().find(|(_, n)| matches!(n, NameMatch::Exact(name) if *name == host)) {
            return server;
        }

        let leading = all()
            .filter_map(|(s, n)| match n {
                NameMatch::Leading(suffix) if host.ends_with(suffix.as_str()) => Some((s, suffix.len())),
                _ => None,
            })
            .max_by_key(|(_, len)| *len);
        if let Some((server, _)) = leading {
            return server;
        }

        let trailing = all()
            .filter_map(|(s, n)| match n {
                NameMatch::Trailing(prefix) if host.starts_with(prefix.as_str()) => Some((s, prefix.len())),
                _ => None,
            })
            .max_by_key(|(_, len)| *len);
        if let Some((server, _)) = trailing {
            return server;
        }

        all()
            .find(|(_, n)| matches!(n, NameMatch::Pattern(re) if re.is_match(&host)))
            .map(|(s, _)| s)
            .unwrap_or(default)
    }
}

impl Resolve for VirtualHosts {
    fn resolve(&self, host: Option<&str>, path: &str) -> EffectiveConfig {
        let server = self.select_server(host);
        let mut directives = server.directives.clone();

        let location = server.select_location(path);
        if let Some(location) = location {
            for (name, values) in &location.directives {
                directives.insert(name.clone(), values.clone());
            }
        }

        EffectiveConfig {
            directives,
            location: location.map(|l| l.pattern.clone()),
        }
    }
}

impl VirtualServer {
    fn compile(config: &ServerConfig) -> anyhow::Result<Self> {
        let names = config
            .server_name
            .iter()
            .map(|name| compile_name(name))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let locations = config
            .locations
            .iter()
            .map(|l| {
                Ok(Location {
                    pattern: l.pattern.clone(),
                    matcher: compile_location(&l.pattern)?,
                    directives: l.directives.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            names,
            directives: config.directives.clone(),
            locations,
        })
    }

    fn select_location(&self, path: &str) -> Option<&Location> {
        if let Some(exact) = self
            .locations
            .iter()
            .find(|l| matches!(&l.matcher, LocationMatch::Exact(p) if p == path))
        {
            return Some(exact);
        }

        let longest = self
            .locations
            .iter()
            .filter_map(|l| match &l.matcher {
                LocationMatch::Priority(p) | LocationMatch::Prefix(p) if path.starts_with(p.as_str()) => {
                    Some((l, p.len()))
                }
                _ => None,
            })
            .max_by_key(|(_, len)| *len)
            .map(|(l, _)| l);

        if let Some(location) = longest {
            if matches!(location.matcher, LocationMatch::Priority(_)) {
                return Some(location);
            }
        }

        self.locations
            .iter()
            .find(|l| matches!(&l.matcher, LocationMatch::Pattern(re) if re.is_match(path)))
            .or(longest)
    }
}

fn compile_name(name: &str) -> anyhow::Result<NameMatch> {
    if let Some(pattern) = name.strip_prefix('~') {
        let re = Regex::new(pattern.trim()).with_context(|| format!("server_name `{name}`"))?;
        return Ok(NameMatch::Pattern(re));
    }
    if let Some(suffix) = name.strip_prefix('*') {
        return Ok(NameMatch::Leading(suffix.to_string()));
    }
    if let Some(prefix) = name.strip_suffix('*') {
        return Ok(NameMatch::Trailing(prefix.to_string()));
    }
    Ok(NameMatch::Exact(name.to_string()))
}

fn compile_location(pattern: &str) -> anyhow::Result<LocationMatch> {
    let (modifier, rest) = match pattern.split_once(char::is_whitespace) {
        Some((m, rest)) if matches!(m, "=" | "^~" | "~" | "~*") => (m, rest.trim()),
        _ => ("", pattern),
    };
    let matcher = match modifier {
        "=" => LocationMatch::Exact(rest.to_string()),
        "^~" => LocationMatch::Priority(rest.to_string()),
        "~" | "~*" => LocationMatch::Pattern(
            RegexBuilder::new(rest)
                .case_insensitive(modifier == "~*")
                .build()
                .with_context(|| format!("location `{pattern}`"))?,
        ),
        _ => LocationMatch::Prefix(rest.to_string()),
    };
    Ok(matcher)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map(|(h, _)| &host[..h.len() + 1]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

/// Directive set that applies to one request.
#[derive(Debug, Clone, Default)]
pub struct EffectiveConfig {
    pub directives: Directives,
    /// Pattern of the matched location, if any.
    pub location: Option<String>,
}

impl EffectiveConfig {
    pub fn values(&self, name: &str) -> &[String] {
        self.directives.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    pub fn root(&self) -> PathBuf {
        PathBuf::from(self.first("root").unwrap_or("public"))
    }

    pub fn index(&self) -> Vec<String> {
        let configured = self.values("index");
        if configured.is_empty() {
            return vec!["index.html".to_string()];
        }
        configured.to_vec()
    }

    pub fn autoindex(&self) -> bool {
        matches!(self.first("autoindex"), Some("on" | "true" | "yes"))
    }

    /// Methods allowed here; GET, POST and DELETE when not configured.
    pub fn allowed_methods(&self) -> Vec<String> {
        let configured = self.values("allow_methods");
        if configured.is_empty() {
            return vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()];
        }
        configured.iter().map(|m| m.to_ascii_uppercase()).collect()
    }

    pub fn allows(&self, method: Method) -> bool {
        self.allowed_methods().iter().any(|m| m == method.as_str())
    }

    pub fn cgi_extensions(&self) -> &[String] {
        self.values("cgi_extensions")
    }

    /// `client_max_body_size` in bytes; `K`, `M` and `G` suffixes accepted.
    pub fn client_max_body_size(&self) -> Option<usize> {
        self.first("client_max_body_size").and_then(parse_size)
    }

    /// File configured by `error_page <code>... <target>`.
    pub fn error_page(&self, status: StatusCode) -> Option<PathBuf> {
        let code = status.as_u16().to_string();
        self.values("error_page").iter().find_map(|entry| {
            let parts: Vec<&str> = entry.split_whitespace().collect();
            let (target, codes) = parts.split_last()?;
            codes
                .contains(&code.as_str())
                .then(|| self.root().join(target.trim_start_matches('/')))
        })
    }

    /// `return <code> <target>`.
    pub fn redirect(&self) -> Option<(StatusCode, String)> {
        let joined = self.values("return").join(" ");
        let mut parts = joined.split_whitespace();
        let status = parts.next()?.parse::<u16>().ok().and_then(StatusCode::from_u16)?;
        let target = parts.next().unwrap_or("").to_string();
        Some((status, target))
    }

    pub fn upload_path(&self) -> Option<PathBuf> {
        self.first("upload_path").map(PathBuf::from)
    }
}

/// `1024`, `8K`, `1m`, `2G`.
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1024),
        'm' | 'M' => (&value[..value.len() - 1], 1024 * 1024),
        'g' | 'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}
