use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::file::File;

/// Configuration for opening a [`File`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The persistent-memory file to open or create.
    pub path: PathBuf,
    /// When enabled, relative reads and writes that share a file offset are
    /// forced to become visible in ticket order, matching program order
    /// across threads. Disabling it removes the wait/validate handshake
    /// from the hot path at the cost of that guarantee.
    pub strict_offset_serial: bool,
    /// Log the effective configuration when a file is opened.
    pub show_config: bool,
    /// Optional file to redirect crate logging into, for interposed
    /// processes whose stderr is not usable. See [`Config::init_logger`].
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: "".into(),
            strict_offset_serial: true,
            show_config: false,
            log_file: None,
        }
    }
}

impl Config {
    /// Read the runtime options from the environment, leaving `path` to be
    /// filled in by the caller. Unset variables keep their defaults.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Some(v) = env_flag("LAPIS_STRICT_OFFSET_SERIAL") {
            config.strict_offset_serial = v;
        }
        if let Some(v) = env_flag("LAPIS_SHOW_CONFIG") {
            config.show_config = v;
        }
        if let Ok(path) = std::env::var("LAPIS_LOG_FILE") {
            if !path.is_empty() {
                config.log_file = Some(path.into());
            }
        }
        config
    }

    /// Open (creating and formatting if empty) the file at `self.path`.
    pub fn open(&self) -> Result<Arc<File>> {
        File::open_with_config(self.clone())
    }

    /// Install an `env_logger` sink honoring `log_file`. Callers that
    /// configure logging themselves can skip this.
    pub fn init_logger(&self) {
        let mut builder = env_logger::Builder::from_default_env();
        if let Some(path) = &self.log_file {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => {
                    builder.target(env_logger::Target::Pipe(Box::new(f)));
                }
                Err(e) => {
                    eprintln!("could not open log file {path:?}: {e}");
                }
            }
        }
        let _ = builder.try_init();
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name) {
        Ok(v) => Some(v != "0" && !v.eq_ignore_ascii_case("false")),
        Err(_) => None,
    }
}
