use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::muxlink::tunnel::registry::Target;

const CONFIG_ENV: &str = "MUXLINK_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["muxlink.toml", "muxlink.yaml", "muxlink.yml"];

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

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps MUXLINK_CONFIG into the flag value; this covers callers
    // that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
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
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join(CONFIG_CANDIDATES[0]));
        }
        return Ok(p);
    }

    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CONFIG_CANDIDATES {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no muxlink.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/muxlink/muxlink.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "muxlink", "muxlink")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("muxlink.toml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub client: ClientConfig,
    pub control: ControlConfig,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: Target,
    pub dial_timeout: Duration,
    pub local_dial_timeout: Duration,
    pub max_bridges: usize,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Zero disables the per-call timeout.
    pub call_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub remote: Target,
    pub local: Target,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    client: Option<FileClient>,

    control: Option<FileControl>,

    #[serde(default)]
    routes: Vec<FileRoute>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    #[serde(default)]
    server_addr: String,
    dial_timeout_ms: Option<i64>,
    local_dial_timeout_ms: Option<i64>,
    max_bridges: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileControl {
    call_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRoute {
    #[serde(default)]
    remote: String,
    #[serde(default)]
    local: String,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        Some(_) => Duration::from_millis(0),
        None => Duration::from_millis(default),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let Some(client) = fc.client else {
            anyhow::bail!("config: missing [client] section");
        };
        let server_addr = client.server_addr.trim();
        if server_addr.is_empty() {
            anyhow::bail!("config: client.server_addr is required");
        }
        let server_addr = Target::parse(server_addr)
            .with_context(|| format!("config: client.server_addr {server_addr:?}"))?;

        let mut dial_timeout = millis(client.dial_timeout_ms, 5000);
        if dial_timeout == Duration::from_millis(0) {
            dial_timeout = Duration::from_millis(5000);
        }
        let mut local_dial_timeout = millis(client.local_dial_timeout_ms, 10_000);
        if local_dial_timeout == Duration::from_millis(0) {
            local_dial_timeout = Duration::from_millis(10_000);
        }

        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            client: ClientConfig {
                server_addr,
                dial_timeout,
                local_dial_timeout,
                max_bridges: client.max_bridges.unwrap_or(1024).max(0) as usize,
            },
            control: ControlConfig {
                call_timeout: millis(fc.control.and_then(|c| c.call_timeout_ms), 0),
            },
            routes: Vec::with_capacity(fc.routes.len()),
        };

        // --- Routes ---
        if fc.routes.is_empty() {
            anyhow::bail!("config: no routes (add at least one [[routes]] entry)");
        }
        for (i, r) in fc.routes.iter().enumerate() {
            if r.remote.trim().is_empty() {
                anyhow::bail!("config: routes[{}] missing remote", i);
            }
            if r.local.trim().is_empty() {
                anyhow::bail!("config: routes[{}] missing local", i);
            }
            let remote = Target::parse(&r.remote)
                .with_context(|| format!("config: routes[{}] invalid remote {:?}", i, r.remote))?;
            let local = Target::parse(&r.local)
                .with_context(|| format!("config: routes[{}] invalid local {:?}", i, r.local))?;
            cfg.routes.push(RouteConfig { remote, local });
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "muxlink_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn toml_with_defaults() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("muxlink.toml");

        let toml = r#"
[client]
server_addr = "10.0.0.1:7000"

[[routes]]
remote = ":8080"
local = "127.0.0.1:9000"

[[routes]]
remote = "unix:/run/remote.sock"
local = "unix:///run/app.sock"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.client.server_addr, Target::Tcp("10.0.0.1:7000".into()));
        assert_eq!(cfg.client.dial_timeout, Duration::from_secs(5));
        assert_eq!(cfg.client.local_dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.client.max_bridges, 1024);
        assert_eq!(cfg.control.call_timeout, Duration::from_millis(0));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(
            cfg.routes,
            vec![
                RouteConfig {
                    remote: Target::Tcp(":8080".into()),
                    local: Target::Tcp("127.0.0.1:9000".into()),
                },
                RouteConfig {
                    remote: Target::Unix("/run/remote.sock".into()),
                    local: Target::Unix("/run/app.sock".into()),
                },
            ]
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_overrides() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("muxlink.yaml");

        let yaml = r#"
admin_addr: ":8081"
client:
  server_addr: "unix:/run/muxlink.sock"
  dial_timeout_ms: 1500
  local_dial_timeout_ms: 2500
  max_bridges: 0
control:
  call_timeout_ms: 3000
routes:
  - remote: ":2222"
    local: "127.0.0.1:22"
logging:
  level: debug
  format: text
  output: discard
"#;

        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.admin_addr, ":8081");
        assert_eq!(
            cfg.client.server_addr,
            Target::Unix("/run/muxlink.sock".into())
        );
        assert_eq!(cfg.client.dial_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.client.local_dial_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.client.max_bridges, 0);
        assert_eq!(cfg.control.call_timeout, Duration::from_secs(3));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.output, "discard");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn server_addr_required() {
        let dir = temp_dir("server_addr");
        let cfg_path = dir.join("muxlink.toml");

        std::fs::write(
            &cfg_path,
            r#"
[client]
server_addr = " "

[[routes]]
remote = ":80"
local = "127.0.0.1:80"
"#,
        )
        .expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("server_addr is required"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn routes_required_and_validated() {
        let dir = temp_dir("routes");
        let cfg_path = dir.join("muxlink.toml");

        std::fs::write(
            &cfg_path,
            r#"
[client]
server_addr = "127.0.0.1:7000"
"#,
        )
        .expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("no routes"));

        std::fs::write(
            &cfg_path,
            r#"
[client]
server_addr = "127.0.0.1:7000"

[[routes]]
remote = ":80"
local = "localhost"
"#,
        )
        .expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("routes[0] invalid local"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_unknown_top_level_field() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("muxlink.toml");

        std::fs::write(
            &cfg_path,
            r#"
listeners = []

[client]
server_addr = "127.0.0.1:7000"
"#,
        )
        .expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(msg.contains("listeners"), "expected error mentioning listeners, got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_dir_prefers_discovered_file() {
        let dir = temp_dir("explicit_dir");
        std::fs::write(dir.join("muxlink.yml"), "").expect("write");

        let resolved = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, dir.join("muxlink.yml"));

        let resolved = resolve_config_path(Some(dir.join("custom"))).expect("resolve");
        assert_eq!(resolved.path, dir.join("custom.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
