use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::aegis::limiter::LimiterSettings;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

    // clap already maps AEGIS_CONFIG into the flag value when unset, but keep the design's
    // precedence clear by treating it as "env" when present.
    if let Some(p) = std::env::var_os("AEGIS_CONFIG") {
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

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("aegis.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["aegis.toml", "aegis.yaml", "aegis.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no aegis.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/aegis/aegis.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        use directories::ProjectDirs;

        let proj = ProjectDirs::from("io", "aegis", "aegis")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("aegis.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
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
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(&fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub backend: String,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub limiter: LimiterSettings,
    pub max_frame_bytes: usize,
    pub upstream_dial_timeout: Duration,
    pub reload: ReloadConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How often the maintenance task runs (audit purge + idle rate-record
    /// eviction).
    pub purge_interval: Duration,
    /// Audit rows older than this are purged.
    pub retain: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    backend: String,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    limiter: Option<FileLimiter>,

    #[serde(default)]
    max_frame_bytes: i64,

    #[serde(default)]
    upstream_dial_timeout_ms: i64,

    reload: Option<FileReload>,

    store: Option<FileStore>,
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
struct FileLimiter {
    max_connections: Option<i64>,
    conn_window_ms: Option<i64>,
    max_packets: Option<i64>,
    packet_window_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    #[serde(default)]
    enabled: bool,
    poll_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileStore {
    purge_interval_ms: Option<i64>,
    retain_ms: Option<i64>,
}

impl Config {
    fn from_file_config(fc: &FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            listen_addr: fc.listen_addr.trim().to_string(),
            backend: fc.backend.trim().to_string(),
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            limiter: LimiterSettings::default(),
            max_frame_bytes: fc.max_frame_bytes.max(0) as usize,
            upstream_dial_timeout: Duration::from_millis(
                fc.upstream_dial_timeout_ms.max(0) as u64
            ),
            reload: ReloadConfig {
                enabled: fc.reload.as_ref().map(|r| r.enabled).unwrap_or(true),
                poll_interval: Duration::from_millis(
                    fc.reload
                        .as_ref()
                        .and_then(|r| r.poll_interval_ms)
                        .unwrap_or(1000)
                        .max(0) as u64,
                ),
            },
            store: StoreConfig {
                purge_interval: Duration::from_millis(
                    fc.store
                        .as_ref()
                        .and_then(|s| s.purge_interval_ms)
                        .unwrap_or(3_600_000)
                        .max(0) as u64,
                ),
                retain: Duration::from_millis(
                    fc.store
                        .as_ref()
                        .and_then(|s| s.retain_ms)
                        .unwrap_or(3_600_000)
                        .max(0) as u64,
                ),
            },
        };

        if cfg.listen_addr.is_empty() {
            cfg.listen_addr = ":25566".into();
        }
        if cfg.backend.is_empty() {
            cfg.backend = "localhost:25565".into();
        }
        if cfg.max_frame_bytes == 0 {
            cfg.max_frame_bytes = 2 * 1024 * 1024;
        }
        if cfg.upstream_dial_timeout == Duration::from_millis(0) {
            cfg.upstream_dial_timeout = Duration::from_millis(5000);
        }

        if let Some(l) = &fc.limiter {
            if let Some(v) = l.max_connections {
                if v <= 0 {
                    anyhow::bail!("config: limiter.max_connections must be positive");
                }
                cfg.limiter.max_connections = v as usize;
            }
            if let Some(v) = l.conn_window_ms {
                if v <= 0 {
                    anyhow::bail!("config: limiter.conn_window_ms must be positive");
                }
                cfg.limiter.conn_window = Duration::from_millis(v as u64);
            }
            if let Some(v) = l.max_packets {
                if v <= 0 {
                    anyhow::bail!("config: limiter.max_packets must be positive");
                }
                cfg.limiter.max_packets = v as usize;
            }
            if let Some(v) = l.packet_window_ms {
                if v <= 0 {
                    anyhow::bail!("config: limiter.packet_window_ms must be positive");
                }
                cfg.limiter.packet_window = Duration::from_millis(v as u64);
            }
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_ascii_lowercase();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_ascii_lowercase();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        // Logging strings validate here so logging::init can use them as-is.
        match cfg.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("config: unknown logging.level {other:?}"),
        }
        match cfg.logging.format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("config: unknown logging.format {other:?}"),
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Aegis configuration (auto-generated)
#
# This file was created because Aegis could not find a configuration file at
# the resolved config path.
#
# Aegis listens on listen_addr, forwards to backend, and enforces per-IP
# sliding-window connection and packet limits on the way through.

listen_addr = ":25566"
backend = "localhost:25565"
admin_addr = ":8080"

[limiter]
max_connections = 5
conn_window_ms = 60000
max_packets = 100
packet_window_ms = 1000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[reload]
enabled = true
poll_interval_ms = 1000

[store]
purge_interval_ms = 3600000
retain_ms = 3600000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Aegis configuration (auto-generated)
#
# This file was created because Aegis could not find a configuration file at
# the resolved config path.
#
# Aegis listens on listen_addr, forwards to backend, and enforces per-IP
# sliding-window connection and packet limits on the way through.

listen_addr: ":25566"
backend: "localhost:25565"
admin_addr: ":8080"

limiter:
  max_connections: 5
  conn_window_ms: 60000
  max_packets: 100
  packet_window_ms: 1000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

reload:
  enabled: true
  poll_interval_ms: 1000

store:
  purge_interval_ms: 3600000
  retain_ms: 3600000
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
        p.push(format!(
            "aegis_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn empty_config_gets_default_limits() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("aegis.toml");

        std::fs::write(&cfg_path, "").expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.listen_addr, ":25566");
        assert_eq!(cfg.backend, "localhost:25565");
        assert_eq!(cfg.limiter.max_connections, 5);
        assert_eq!(cfg.limiter.conn_window, Duration::from_secs(60));
        assert_eq!(cfg.limiter.max_packets, 100);
        assert_eq!(cfg.limiter.packet_window, Duration::from_secs(1));
        assert_eq!(cfg.upstream_dial_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.store.purge_interval, Duration::from_secs(3600));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn limiter_overrides_apply() {
        let dir = temp_dir("limits");
        let cfg_path = dir.join("aegis.toml");

        let toml = r#"
listen_addr = ":7777"
backend = "mc.internal:25565"

[limiter]
max_connections = 2
conn_window_ms = 30000
max_packets = 10
packet_window_ms = 500
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_addr, ":7777");
        assert_eq!(cfg.backend, "mc.internal:25565");
        assert_eq!(cfg.limiter.max_connections, 2);
        assert_eq!(cfg.limiter.conn_window, Duration::from_millis(30000));
        assert_eq!(cfg.limiter.max_packets, 10);
        assert_eq!(cfg.limiter.packet_window, Duration::from_millis(500));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn nonpositive_limits_are_rejected() {
        let dir = temp_dir("bad_limits");
        let cfg_path = dir.join("aegis.toml");

        let toml = r#"
[limiter]
max_connections = 0
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("max_connections"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn logging_strings_normalize_and_validate() {
        let dir = temp_dir("logging");
        let cfg_path = dir.join("aegis.toml");

        let toml = r#"
[logging]
level = " WARN "
format = "Text"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.logging.format, "text");

        let bad = r#"
[logging]
level = "verbose"
"#;
        std::fs::write(&cfg_path, bad).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("logging.level"));

        let bad = r#"
[logging]
format = "pretty"
"#;
        std::fs::write(&cfg_path, bad).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("logging.format"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("aegis.toml");

        let toml = r#"
proxy_port = 25566
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn template_round_trips_through_loader() {
        let dir = temp_dir("template");
        let cfg_path = dir.join("aegis.toml");

        assert!(ensure_config_file(&cfg_path).expect("ensure"));
        assert!(!ensure_config_file(&cfg_path).expect("ensure again"));
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.limiter.max_connections, 5);

        let yaml_path = dir.join("aegis.yaml");
        assert!(ensure_config_file(&yaml_path).expect("ensure yaml"));
        let cfg = load_config(&yaml_path).expect("load yaml");
        assert_eq!(cfg.backend, "localhost:25565");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
