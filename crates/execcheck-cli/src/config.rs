//! Configuration file management for execcheck.
//!
//! Provides a TOML-based config file at `~/.config/execcheck/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use execcheck_core::fixture::{DEFAULT_IMAGE, FixtureConfig};
use execcheck_core::runner::DEFAULT_TIMEOUT;

pub const ENV_IMAGE: &str = "EXECCHECK_IMAGE";
pub const ENV_COUNT: &str = "EXECCHECK_COUNT";
pub const ENV_TIMEOUT_SECS: &str = "EXECCHECK_TIMEOUT_SECS";
pub const ENV_DOCKER: &str = "EXECCHECK_DOCKER";

pub const DEFAULT_COUNT: usize = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub image: String,
    pub docker_binary: String,
    pub pull: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            docker_binary: "docker".to_string(),
            pull: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Concurrent workers per round.
    pub count: usize,
    /// Per-process wait bound; `0` waits forever.
    pub timeout_secs: u64,
    /// Rounds per run.
    pub repeat: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            repeat: 1,
        }
    }
}

/// `$XDG_CONFIG_HOME/execcheck/config.toml`, falling back to
/// `~/.config/execcheck/config.toml`. XDG layout is used on macOS too.
pub fn config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("execcheck")
        .join("config.toml")
}

/// Read the config file. `Ok(None)` when there is none.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    toml::from_str(&contents)
        .map(Some)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Write the config file owner-only (0600 on Unix).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Values given on the command line; `None` falls through the chain.
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub image: Option<String>,
    pub count: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub repeat: Option<usize>,
    pub no_pull: bool,
    /// With `--until-fails`, `repeat = 0` means no upper bound.
    pub until_fails: bool,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub fixture: FixtureConfig,
    pub count: usize,
    pub timeout: Option<Duration>,
    pub repeat: usize,
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} is not a valid number: {raw:?}")),
        Err(_) => Ok(None),
    }
}

impl ResolvedConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// A config file that exists but does not parse is an error; a missing
    /// one is not. Settings that would verify no process at all are
    /// rejected.
    pub fn resolve(cli: &RunOverrides) -> Result<Self> {
        let file = load_config()?.unwrap_or_default();

        let image = cli
            .image
            .clone()
            .or_else(|| std::env::var(ENV_IMAGE).ok())
            .unwrap_or(file.runtime.image);

        let docker = std::env::var(ENV_DOCKER).unwrap_or(file.runtime.docker_binary);

        let count = match cli.count {
            Some(n) => n,
            None => env_parsed(ENV_COUNT)?.unwrap_or(file.run.count),
        };

        let timeout_secs = match cli.timeout_secs {
            Some(n) => n,
            None => env_parsed(ENV_TIMEOUT_SECS)?.unwrap_or(file.run.timeout_secs),
        };

        let repeat = cli.repeat.unwrap_or(file.run.repeat);

        if count == 0 {
            bail!("count must be at least 1: zero workers verify nothing");
        }
        if repeat == 0 && !cli.until_fails {
            bail!("repeat must be at least 1 (0 is only allowed with --until-fails)");
        }

        Ok(Self {
            fixture: FixtureConfig {
                docker,
                image,
                name: None,
                pull: file.runtime.pull && !cli.no_pull,
            },
            count,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            repeat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    /// Point XDG_CONFIG_HOME at a fresh temp dir and clear the EXECCHECK_*
    /// variables.
    fn isolated_env() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        for name in [ENV_IMAGE, ENV_COUNT, ENV_TIMEOUT_SECS, ENV_DOCKER] {
            unsafe { std::env::remove_var(name) };
        }
        tmp
    }

    fn clear_env() {
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        for name in [ENV_IMAGE, ENV_COUNT, ENV_TIMEOUT_SECS, ENV_DOCKER] {
            unsafe { std::env::remove_var(name) };
        }
    }

    #[test]
    fn defaults_when_nothing_set() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        let resolved = ResolvedConfig::resolve(&RunOverrides::default()).unwrap();
        clear_env();

        assert_eq!(resolved.fixture.image, DEFAULT_IMAGE);
        assert_eq!(resolved.fixture.docker, "docker");
        assert!(resolved.fixture.pull);
        assert_eq!(resolved.count, DEFAULT_COUNT);
        assert_eq!(resolved.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(resolved.repeat, 1);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        let mut cfg = ConfigFile::default();
        cfg.runtime.image = "alpine:3".to_string();
        cfg.run.count = 25;
        save_config(&cfg).unwrap();
        let loaded = load_config().unwrap().expect("config was just written");
        let path = config_path();
        clear_env();

        assert_eq!(loaded.runtime.image, "alpine:3");
        assert_eq!(loaded.run.count, 25);
        assert!(path.ends_with("execcheck/config.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let _tmp = isolated_env();

        save_config(&ConfigFile::default()).unwrap();
        let meta = std::fs::metadata(config_path()).unwrap();
        clear_env();

        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn file_overrides_default() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        std::fs::create_dir_all(config_path().parent().unwrap()).unwrap();
        std::fs::write(
            config_path(),
            "[run]\ncount = 4\ntimeout_secs = 0\n\n[runtime]\npull = false\n",
        )
        .unwrap();
        let resolved = ResolvedConfig::resolve(&RunOverrides::default()).unwrap();
        clear_env();

        assert_eq!(resolved.count, 4);
        assert_eq!(resolved.timeout, None, "0 means unbounded");
        assert!(!resolved.fixture.pull);
        assert_eq!(resolved.fixture.image, DEFAULT_IMAGE, "missing keys default");
    }

    #[test]
    fn env_overrides_file() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        std::fs::create_dir_all(config_path().parent().unwrap()).unwrap();
        std::fs::write(config_path(), "[run]\ncount = 4\n").unwrap();
        unsafe { std::env::set_var(ENV_COUNT, "12") };
        unsafe { std::env::set_var(ENV_IMAGE, "busybox:musl") };
        unsafe { std::env::set_var(ENV_DOCKER, "podman") };

        let resolved = ResolvedConfig::resolve(&RunOverrides::default()).unwrap();
        clear_env();

        assert_eq!(resolved.count, 12);
        assert_eq!(resolved.fixture.image, "busybox:musl");
        assert_eq!(resolved.fixture.docker, "podman");
    }

    #[test]
    fn cli_overrides_env() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        unsafe { std::env::set_var(ENV_COUNT, "12") };
        unsafe { std::env::set_var(ENV_TIMEOUT_SECS, "9") };

        let resolved = ResolvedConfig::resolve(&RunOverrides {
            count: Some(3),
            timeout_secs: Some(2),
            repeat: Some(7),
            no_pull: true,
            ..RunOverrides::default()
        })
        .unwrap();
        clear_env();

        assert_eq!(resolved.count, 3);
        assert_eq!(resolved.timeout, Some(Duration::from_secs(2)));
        assert_eq!(resolved.repeat, 7);
        assert!(!resolved.fixture.pull);
    }

    #[test]
    fn invalid_env_number_is_an_error() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        unsafe { std::env::set_var(ENV_COUNT, "many") };
        let result = ResolvedConfig::resolve(&RunOverrides::default());
        clear_env();

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains(ENV_COUNT), "unexpected error: {msg}");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        std::fs::create_dir_all(config_path().parent().unwrap()).unwrap();
        std::fs::write(config_path(), "[run\ncount = ").unwrap();
        let result = ResolvedConfig::resolve(&RunOverrides::default());
        clear_env();

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("failed to parse config file"), "unexpected error: {msg}");
    }

    #[test]
    fn missing_file_loads_as_none() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        let loaded = load_config().unwrap();
        clear_env();

        assert!(loaded.is_none());
    }

    #[test]
    fn zero_count_is_rejected() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        let from_cli = ResolvedConfig::resolve(&RunOverrides {
            count: Some(0),
            ..RunOverrides::default()
        });
        unsafe { std::env::set_var(ENV_COUNT, "0") };
        let from_env = ResolvedConfig::resolve(&RunOverrides::default());
        clear_env();

        for result in [from_cli, from_env] {
            let msg = format!("{:#}", result.unwrap_err());
            assert!(msg.contains("count must be at least 1"), "unexpected error: {msg}");
        }
    }

    #[test]
    fn zero_repeat_needs_until_fails() {
        let _lock = lock_env();
        let _tmp = isolated_env();

        std::fs::create_dir_all(config_path().parent().unwrap()).unwrap();
        std::fs::write(config_path(), "[run]\nrepeat = 0\n").unwrap();
        let bounded = ResolvedConfig::resolve(&RunOverrides::default());
        let unbounded = ResolvedConfig::resolve(&RunOverrides {
            until_fails: true,
            ..RunOverrides::default()
        });
        clear_env();

        let msg = format!("{:#}", bounded.unwrap_err());
        assert!(msg.contains("repeat must be at least 1"), "unexpected error: {msg}");
        assert_eq!(unbounded.unwrap().repeat, 0);
    }
}
