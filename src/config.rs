use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    sync_root: Option<PathBuf>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    remote_url: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    heartbeat_ms: Option<u64>,
}

/// Resolved, validated configuration for one sync engine instance.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Local directory tree being synchronized.
    pub sync_root: PathBuf,
    /// Identity string tagged onto records this engine materializes; not
    /// interpreted by the engine itself.
    pub owner: String,
    /// Base URL of the remote object store.
    pub remote_url: String,
    /// Which id-derivation family to use for `sync_root`. Auto-detected from
    /// the running OS unless overridden (mainly useful for tests that need
    /// to exercise a platform's rules on a host that isn't that platform).
    pub platform: crate::metadata::IdPlatform,
    /// The remote watcher's poll interval, used by the trash-with-parent
    /// coalescer as "time for the feed to catch up" (spec.md S4.7).
    pub heartbeat_ms: u64,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub sync_root: Option<PathBuf>,
    pub owner: Option<String>,
    pub remote_url: Option<String>,
    pub platform: Option<String>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".foldersync").join("logs").join("foldersync.log")
}

const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

impl Config {
    pub fn default_sync_root() -> PathBuf {
        home_dir().join("FolderSync")
    }

    pub fn default_remote_url() -> &'static str {
        "https://cozy.example.org"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".foldersync").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("SYNC_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir().join(".config").join("foldersync").join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let sync_root = overrides
            .sync_root
            .or(env_cfg.sync_root)
            .or(file_cfg.sync_root)
            .unwrap_or_else(Self::default_sync_root);
        let owner = overrides
            .owner
            .or(env_cfg.owner)
            .or(file_cfg.owner)
            .unwrap_or_default();
        let remote_url = overrides
            .remote_url
            .or(env_cfg.remote_url)
            .or(file_cfg.remote_url)
            .unwrap_or_else(|| Self::default_remote_url().to_string());
        let platform_raw = overrides
            .platform
            .or(env_cfg.platform)
            .or(file_cfg.platform);
        let heartbeat_ms = env_cfg.heartbeat_ms.or(file_cfg.heartbeat_ms).unwrap_or(DEFAULT_HEARTBEAT_MS);

        let platform = match platform_raw {
            Some(raw) => parse_platform(&raw)?,
            None => crate::metadata::IdPlatform::detect(),
        };

        let mut cfg = Config {
            sync_root,
            owner,
            remote_url,
            platform,
            heartbeat_ms,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        save_config_file(path, self)
    }

    fn normalize(&mut self) -> Result<()> {
        self.sync_root = absolutize_path(&self.sync_root);
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize_path(&p));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.owner.is_empty() {
            validate_email(&self.owner)?;
        }
        validate_url(&self.remote_url).context("remote_url")?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    sync_root: &'a PathBuf,
    owner: &'a str,
    remote_url: &'a str,
    platform: &'a str,
    heartbeat_ms: u64,
}

fn save_config_file(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let persisted = PersistedConfig {
        sync_root: &cfg.sync_root,
        owner: &cfg.owner,
        remote_url: &cfg.remote_url,
        platform: cfg.platform.as_str(),
        heartbeat_ms: cfg.heartbeat_ms,
    };
    let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn parse_platform(raw: &str) -> Result<crate::metadata::IdPlatform> {
    crate::metadata::IdPlatform::parse(raw)
        .ok_or_else(|| anyhow::anyhow!("invalid platform: {raw} (expected unix, hfs, or ntfs)"))
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap()
    });
    if PATTERN.is_match(email) {
        Ok(())
    } else {
        anyhow::bail!("invalid owner identity: {email}")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) => {
            *path = rebuild_components(&comps);
            false
        }
        Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("SYNC_OWNER") {
        let v = v.trim();
        if !v.is_empty() {
            out.owner = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYNC_ROOT") {
        let v = v.trim();
        if !v.is_empty() {
            out.sync_root = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("SYNC_REMOTE_URL") {
        let v = v.trim();
        if !v.is_empty() {
            out.remote_url = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYNC_PLATFORM") {
        let v = v.trim();
        if !v.is_empty() {
            out.platform = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYNC_HEARTBEAT_MS") {
        if let Ok(ms) = v.trim().parse() {
            out.heartbeat_ms = Some(ms);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> =
        once_cell::sync::Lazy::new(|| Mutex::new(()));

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn env_keys() -> &'static [&'static str] {
        &[
            "SYNC_OWNER",
            "SYNC_ROOT",
            "SYNC_REMOTE_URL",
            "SYNC_PLATFORM",
            "SYNC_HEARTBEAT_MS",
            "SYNC_CONFIG_PATH",
        ]
    }

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn load_config_from_json_and_normalize() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = make_temp_dir("foldersync-config-test");
        let cfg_path = tmp.join("config.json");
        let sync_root = tmp.join("data").display().to_string().replace('\\', "/");
        let json = format!(
            r#"{{
                "owner": "Alice@Example.com",
                "sync_root": "{sync_root}",
                "remote_url": "http://127.0.0.1:8080"
            }}"#
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.owner, "Alice@Example.com");
        assert_eq!(cfg.remote_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
        assert!(cfg.sync_root.is_absolute());
        assert_eq!(cfg.heartbeat_ms, DEFAULT_HEARTBEAT_MS);
    }

    #[test]
    fn reject_invalid_url_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = make_temp_dir("foldersync-config-test-bad-url");
        let cfg_path = tmp.join("config.json");
        let json = r#"{
            "owner": "alice@example.com",
            "sync_root": "/tmp/data",
            "remote_url": "ftp://bad.example.com"
        }"#;
        fs::write(&cfg_path, json).unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("remote_url"));
    }

    #[test]
    fn reject_invalid_owner() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());
        for k in env_keys() {
            env::remove_var(k);
        }

        let tmp = make_temp_dir("foldersync-config-test-bad-owner");
        let cfg_path = tmp.join("config.json");
        let json = r#"{
            "owner": "not-an-email",
            "sync_root": "/tmp/data",
            "remote_url": "http://localhost:8080"
        }"#;
        fs::write(&cfg_path, json).unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("invalid owner"));
    }

    #[test]
    fn load_with_overrides_flag_beats_env_beats_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(env_keys());

        let tmp = make_temp_dir("foldersync-config-precedence");
        let file_root = tmp.join("file-data");
        let env_root = tmp.join("env-data");
        let flag_root = tmp.join("flag-data");

        let cfg_path = tmp.join("config.json");
        let file_root_str = file_root.display().to_string().replace('\\', "/");
        fs::write(
            &cfg_path,
            format!(
                r#"{{
              "owner": "file@example.com",
              "sync_root": "{file_root_str}",
              "remote_url": "https://file.example.org"
            }}"#
            ),
        )
        .unwrap();

        env::set_var("SYNC_OWNER", "env@example.com");
        env::set_var("SYNC_ROOT", env_root.to_string_lossy().as_ref());
        env::set_var("SYNC_REMOTE_URL", "https://env.example.org");

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.owner, "env@example.com");
        assert_eq!(cfg.sync_root, env_root);
        assert_eq!(cfg.remote_url, "https://env.example.org");

        let overrides = ConfigOverrides {
            owner: Some("flag@example.com".to_string()),
            sync_root: Some(flag_root.clone()),
            remote_url: Some("https://flag.example.org".to_string()),
            platform: None,
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.owner, "flag@example.com");
        assert_eq!(cfg.sync_root, flag_root);
        assert_eq!(cfg.remote_url, "https://flag.example.org");
    }

    #[test]
    fn default_log_file_path_matches_convention() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(&["HOME"]);

        let tmp = make_temp_dir("foldersync-log-path-home");
        env::set_var("HOME", &tmp);

        let p = default_log_file_path();
        assert!(p.ends_with(".foldersync/logs/foldersync.log"));
        assert!(p.to_string_lossy().contains(tmp.to_string_lossy().as_ref()));
    }
}
