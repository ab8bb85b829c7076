use std::path::PathBuf;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

/// Server-assigned routing key carried in the first 4 bytes of every data stream.
pub type RouteId = u32;

/// A dial destination: a TCP `host:port` or a Unix-domain socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Tcp(String),
    Unix(PathBuf),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("empty address")]
    Empty,
    #[error("unknown scheme {0:?} (expected tcp or unix)")]
    UnknownScheme(String),
    #[error("tcp address {0:?} must be host:port")]
    MissingPort(String),
}

impl Target {
    /// Parses `unix:<path>`, `unix://<path>`, `tcp://<addr>`, `tcp:<addr>` or a bare `host:port`.
    ///
    /// The `":PORT"` shorthand is kept verbatim; it is meaningful to the server
    /// (listen on all interfaces) and rejected by local dialing.
    pub fn parse(s: &str) -> Result<Self, TargetParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TargetParseError::Empty);
        }

        if let Some((scheme, rest)) = split_scheme(s) {
            let rest = rest.strip_prefix("//").unwrap_or(rest).trim();
            return match scheme.to_ascii_lowercase().as_str() {
                "unix" => {
                    if rest.is_empty() {
                        return Err(TargetParseError::Empty);
                    }
                    Ok(Target::Unix(PathBuf::from(rest)))
                }
                "tcp" => Self::tcp(rest),
                other => Err(TargetParseError::UnknownScheme(other.to_string())),
            };
        }

        Self::tcp(s)
    }

    fn tcp(addr: &str) -> Result<Self, TargetParseError> {
        if addr.is_empty() {
            return Err(TargetParseError::Empty);
        }
        match addr.rsplit_once(':') {
            Some((_, port)) if !port.is_empty() => Ok(Target::Tcp(addr.to_string())),
            _ => Err(TargetParseError::MissingPort(addr.to_string())),
        }
    }

    pub fn network(&self) -> &'static str {
        match self {
            Target::Tcp(_) => "tcp",
            Target::Unix(_) => "unix",
        }
    }

    /// The address without its scheme, as sent to the control endpoint.
    pub fn address(&self) -> String {
        match self {
            Target::Tcp(a) => a.clone(),
            Target::Unix(p) => p.display().to_string(),
        }
    }
}

// A scheme is an alphabetic prefix before ':' that is not itself part of a
// host:port pair ("localhost:80" must stay tcp).
fn split_scheme(s: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = s.split_once(':')?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    if rest.starts_with("//") || scheme.eq_ignore_ascii_case("unix") {
        return Some((scheme, rest));
    }
    if scheme.eq_ignore_ascii_case("tcp") && !rest.chars().all(|c| c.is_ascii_digit()) {
        return Some((scheme, rest));
    }
    None
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Tcp(a) => write!(f, "tcp://{a}"),
            Target::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteEntry {
    pub id: RouteId,
    pub network: &'static str,
    pub target: String,
}

/// Maps route ids to local targets.
///
/// Entries are never evicted; re-registering an id overwrites it.
#[derive(Debug, Default)]
pub struct Registry {
    routes: DashMap<RouteId, Target>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `id -> target`, returning whatever the id pointed at before.
    pub fn register(&self, id: RouteId, target: Target) -> Option<Target> {
        self.routes.insert(id, target)
    }

    pub fn resolve(&self, id: RouteId) -> Option<Target> {
        self.routes.get(&id).map(|t| t.value().clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let mut out: Vec<RouteEntry> = self
            .routes
            .iter()
            .map(|e| RouteEntry {
                id: *e.key(),
                network: e.value().network(),
                target: e.value().address(),
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }
}
