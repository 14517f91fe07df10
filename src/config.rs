//! Spawn configuration
//!
//! Describes what to run on the pseudoterminal. Values come from an optional
//! TOML file and can be overridden on the command line.
//! Precedence: CLI > file > defaults.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

/// CLI arguments for `pty-run`
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pty-run")]
#[command(version)]
#[command(about = "Run a program on a fresh pseudo-terminal and relay its I/O", long_about = None)]
pub struct CliArgs {
    /// Path to a TOML config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Value of TERM for the child
    #[arg(short, long, value_name = "TERM")]
    pub term: Option<String>,

    /// Extra environment entry for the child (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Pass this process's environment on to the child
    #[arg(long)]
    pub inherit_env: bool,

    /// Program to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

/// What to spawn and with which environment
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Executable path. Defaults to `$SHELL`, then `/bin/sh`.
    pub program: Option<String>,
    /// Arguments after the program name
    pub args: Vec<String>,
    /// `KEY=VALUE` entries for the child
    pub env: Vec<String>,
    /// TERM for the child, unless `env` already sets one
    pub term: Option<String>,
    /// Start from this process's environment instead of an empty one
    pub inherit_env: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: Vec::new(),
            term: Some("ansi".to_string()),
            inherit_env: false,
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Program {0:?} not found in PATH")]
    ProgramNotFound(String),
}

impl SessionConfig {
    /// Load with precedence CLI > file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_args(&mut self, args: &CliArgs) {
        if let Some((program, rest)) = args.command.split_first() {
            self.program = Some(program.clone());
            self.args = rest.to_vec();
        }
        if let Some(term) = &args.term {
            self.term = Some(term.clone());
        }
        self.env.extend(args.env.iter().cloned());
        if args.inherit_env {
            self.inherit_env = true;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(program) = &self.program {
            if program.is_empty() {
                return Err(ConfigError::Invalid("program must not be empty".to_string()));
            }
        }
        if let Some(entry) = self.env.iter().find(|e| !is_env_entry(e)) {
            return Err(ConfigError::Invalid(format!(
                "environment entry {:?} is not KEY=VALUE",
                entry
            )));
        }
        if let Some(term) = &self.term {
            if term.is_empty() {
                return Err(ConfigError::Invalid("term must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Executable path to spawn
    pub fn program(&self) -> String {
        self.program
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    /// Path to hand to `spawn`
    ///
    /// Bare program names are looked up in this process's `PATH`, since the
    /// child is started without a search.
    pub fn executable(&self) -> Result<String, ConfigError> {
        self.executable_in(std::env::var_os("PATH").as_deref())
    }

    fn executable_in(&self, search_path: Option<&OsStr>) -> Result<String, ConfigError> {
        let program = self.program();
        if program.contains('/') {
            return Ok(program);
        }
        search_path
            .and_then(|dirs| find_in_path(&program, dirs))
            .and_then(|found| found.into_os_string().into_string().ok())
            .ok_or(ConfigError::ProgramNotFound(program))
    }

    /// Full argument vector, with the program's file name as `argv[0]`
    pub fn argv(&self) -> Vec<String> {
        let program = self.program();
        let name = Path::new(&program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        std::iter::once(name).chain(self.args.iter().cloned()).collect()
    }

    /// The child's environment as `KEY=VALUE` entries
    ///
    /// Later entries override earlier ones with the same key. TERM is added
    /// only when nothing else sets it.
    pub fn environment(&self) -> Vec<String> {
        let inherited: Vec<String> = if self.inherit_env {
            std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect()
        } else {
            Vec::new()
        };
        merge_environment(inherited, &self.env, self.term.as_deref())
    }
}

/// First executable file called `name` in a `PATH`-style list
fn find_in_path(name: &str, dirs: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(dirs)
        .map(|dir| {
            // An empty entry means the current directory
            if dir.as_os_str().is_empty() {
                Path::new(".").join(name)
            } else {
                dir.join(name)
            }
        })
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn is_env_entry(entry: &str) -> bool {
    matches!(entry.split_once('='), Some((key, _)) if !key.is_empty())
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

fn merge_environment(base: Vec<String>, overrides: &[String], term: Option<&str>) -> Vec<String> {
    let mut merged = base;
    for entry in overrides {
        let key = env_key(entry);
        merged.retain(|existing| env_key(existing) != key);
        merged.push(entry.clone());
    }
    if let Some(term) = term {
        if !overrides.iter().any(|e| env_key(e) == "TERM") {
            merged.retain(|existing| env_key(existing) != "TERM");
            merged.push(format!("TERM={}", term));
        }
    }
    merged
}
