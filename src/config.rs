//! Layered configuration: defaults < file < environment < CLI flags.
//!
//! Grounded on the teacher's own conf-file-plus-flags layering (its `conf`
//! module and `main.rs`'s `Conf`/CLI wiring), scoped down to the knobs this
//! VM actually has.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub heap_words: usize,
    pub stack_page_words: usize,
    pub trace_gc: bool,
    pub trace_send: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heap_words: 1 << 20,
            stack_page_words: 4096,
            trace_gc: false,
            trace_send: false,
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Layer a `talon.toml` file over the defaults, if present.
    pub fn merge_file(mut self, path: &Path) -> Self {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(file_config) = toml::from_str::<Config>(&text) {
                self = file_config;
            }
        }
        self
    }

    /// Layer `TALON_*` environment variables over the current state.
    pub fn merge_env(mut self) -> Self {
        if let Ok(mb) = std::env::var("TALON_HEAP_MB") {
            if let Ok(mb) = mb.parse::<usize>() {
                self.heap_words = (mb * 1024 * 1024) / 8;
            }
        }
        if let Ok(flag) = std::env::var("TALON_TRACE_GC") {
            self.trace_gc = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        self
    }

    pub fn default_config_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("talon").join("talon.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_converts_megabytes_to_words() {
        std::env::set_var("TALON_HEAP_MB", "8");
        let config = Config::default().merge_env();
        assert_eq!(config.heap_words, 8 * 1024 * 1024 / 8);
        std::env::remove_var("TALON_HEAP_MB");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::default().merge_file(Path::new("/nonexistent/talon.toml"));
        assert_eq!(config.heap_words, Config::default().heap_words);
    }
}
