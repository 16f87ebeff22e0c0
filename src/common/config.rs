//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;
use crate::dap::DebugConfiguration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Debug adapter executables, keyed by debug type
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,

    /// Session engine settings
    #[serde(default)]
    pub session: SessionSettings,

    /// Identity reported to adapters in `initialize`
    #[serde(default)]
    pub client: ClientSettings,
}

/// Configuration for a debug adapter
#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    /// Path to the adapter executable
    pub path: PathBuf,

    /// Additional arguments to pass to the adapter
    #[serde(default)]
    pub args: Vec<String>,
}

/// Session engine settings
#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    /// Window in which `stopped`/`thread` events collapse into one `threads` request
    #[serde(default = "default_threads_debounce")]
    pub threads_debounce_ms: u64,

    /// Number of frames requested when a thread becomes current
    #[serde(default = "default_stack_frame_levels")]
    pub stack_frame_levels: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            threads_debounce_ms: default_threads_debounce(),
            stack_frame_levels: default_stack_frame_levels(),
        }
    }
}

impl SessionSettings {
    pub fn threads_debounce(&self) -> Duration {
        Duration::from_millis(self.threads_debounce_ms)
    }
}

fn default_threads_debounce() -> u64 {
    100
}
fn default_stack_frame_levels() -> i64 {
    20
}

/// Client identity fields
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            client_name: default_client_name(),
            locale: default_locale(),
        }
    }
}

fn default_client_id() -> String {
    "dap-session".to_string()
}
fn default_client_name() -> String {
    "DAP Session Engine".to_string()
}
fn default_locale() -> String {
    "en-US".to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = read_file(path)?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Get adapter configuration by debug type
    ///
    /// Falls back to searching PATH if not explicitly configured
    pub fn get_adapter(&self, name: &str) -> Option<AdapterConfig> {
        if let Some(config) = self.adapters.get(name) {
            return Some(config.clone());
        }

        which::which(name).ok().map(|path| AdapterConfig {
            path,
            args: Vec::new(),
        })
    }
}

/// A breakpoint declared in a launch file
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LaunchBreakpoint {
    pub path: String,
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Launch file consumed by the CLI
#[derive(Debug, Deserialize, Default)]
pub struct LaunchFile {
    #[serde(default)]
    pub configurations: Vec<DebugConfiguration>,

    #[serde(default)]
    pub breakpoints: Vec<LaunchBreakpoint>,
}

impl LaunchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = read_file(path)?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Find a configuration by name, or the first one when no name is given
    pub fn configuration(&self, name: Option<&str>) -> Option<&DebugConfiguration> {
        match name {
            Some(name) => self.configurations.iter().find(|c| c.name == name),
            None => self.configurations.first(),
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.session.threads_debounce_ms, 100);
        assert_eq!(config.session.stack_frame_levels, 20);
        assert_eq!(config.client.client_id, "dap-session");
    }

    #[test]
    fn test_load_adapter_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[adapters.lldb]
path = "/opt/llvm/bin/lldb-dap"
args = ["--repl-mode", "command"]

[session]
threads_debounce_ms = 50
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        let adapter = config.get_adapter("lldb").unwrap();
        assert_eq!(adapter.path, PathBuf::from("/opt/llvm/bin/lldb-dap"));
        assert_eq!(adapter.args, vec!["--repl-mode", "command"]);
        assert_eq!(config.session.threads_debounce(), Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session\nthreads_debounce_ms = ").unwrap();
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, crate::Error::ConfigParse(_)));
    }

    #[test]
    fn test_launch_file_selects_configuration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[configurations]]
type = "lldb"
request = "launch"
name = "Run tests"
program = "target/debug/app"

[[configurations]]
type = "debugpy"
request = "attach"
name = "Attach"
processId = 1234

[[breakpoints]]
path = "src/main.rs"
line = 12
"#
        )
        .unwrap();

        let launch = LaunchFile::load(file.path()).unwrap();
        assert_eq!(launch.configuration(None).unwrap().name, "Run tests");
        let attach = launch.configuration(Some("Attach")).unwrap();
        assert_eq!(attach.debug_type, "debugpy");
        assert_eq!(attach.fields.get("processId"), Some(&serde_json::json!(1234)));
        assert_eq!(launch.breakpoints.len(), 1);
    }
}
