use anyhow::{Context, Result, bail};
use libtermkeep::ManagerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termkeep_protocol::DEFAULT_OUTPUT_BUFFER_SIZE;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Seconds an orphaned session survives; 0 keeps it until closed.
    pub orphan_grace_period_secs: u64,
    pub output_buffer_size: usize,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub default_cwd: Option<PathBuf>,
}

impl ServerConfig {
    /// Defaults, then the config file (explicit path or the default location
    /// if present), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Apply environment-style overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TERMKEEP_LISTEN") {
            self.listen = value
                .parse()
                .with_context(|| format!("invalid TERMKEEP_LISTEN value: {value}"))?;
        }
        if let Some(value) = lookup("ORPHAN_GRACE_PERIOD") {
            self.orphan_grace_period_secs = value
                .trim()
                .parse()
                .with_context(|| format!("invalid ORPHAN_GRACE_PERIOD value: {value}"))?;
        }
        if let Some(value) = lookup("OUTPUT_BUFFER_SIZE") {
            self.output_buffer_size = value
                .trim()
                .parse()
                .with_context(|| format!("invalid OUTPUT_BUFFER_SIZE value: {value}"))?;
        }
        if let Some(shell) = lookup("TERMKEEP_SHELL").or_else(|| lookup("SHELL")) {
            if !shell.trim().is_empty() {
                self.shell = shell;
            }
        }
        if let Some(cwd) = lookup("TERMKEEP_CWD") {
            self.default_cwd = Some(PathBuf::from(cwd));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_buffer_size == 0 {
            bail!("output_buffer_size must be greater than zero");
        }
        if self.shell.trim().is_empty() {
            bail!("shell must not be empty");
        }
        Ok(())
    }

    pub fn orphan_grace_period(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_period_secs)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let default_cwd = self.default_cwd.clone().unwrap_or_else(home_or_current_dir);
        ManagerConfig {
            orphan_grace_period: self.orphan_grace_period(),
            output_buffer_size: self.output_buffer_size,
            shell: self.shell.clone(),
            shell_args: self.shell_args.clone(),
            default_cwd,
        }
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            orphan_grace_period_secs: 0,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            shell: "/bin/bash".to_string(),
            shell_args: Vec::new(),
            default_cwd: None,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("termkeep")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("termkeep")
    } else {
        PathBuf::from("/tmp/termkeep")
    }
}

fn home_or_current_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .filter(|home| home.is_dir())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}
