//! TOML configuration of the daemon, every section optional.

use std::{fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::{CommandParser, DispatchPolicy, RequiredHeaders};

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration for the Groupie LMTP daemon.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lmtp: LmtpConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub groups: GroupsConfig,

    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub invite: InviteConfig,
}

/// LMTP listener configuration.
#[derive(Debug, Deserialize)]
pub struct LmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name announced in the greeting and the LHLO reply.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Largest accepted message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for LmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Signature verification policy.
#[derive(Debug, Deserialize)]
pub struct VerificationConfig {
    /// Headers the DKIM signature must cover, `from` is always added.
    #[serde(default = "default_required_headers")]
    pub required_headers: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            required_headers: default_required_headers(),
        }
    }
}

impl VerificationConfig {
    pub fn required_headers(&self) -> RequiredHeaders {
        RequiredHeaders::new(&self.required_headers)
    }
}

/// Command address configuration.
#[derive(Debug, Deserialize)]
pub struct CommandsConfig {
    /// Administrative domains accepting command addresses.
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub case_sensitive_verbs: bool,

    #[serde(default = "default_true")]
    pub case_sensitive_groups: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            case_sensitive_verbs: false,
            case_sensitive_groups: true,
        }
    }
}

impl CommandsConfig {
    pub fn parser(&self) -> CommandParser {
        CommandParser::new(&self.domains)
            .with_case_sensitivity(self.case_sensitive_verbs, self.case_sensitive_groups)
    }
}

/// Group policy configuration.
#[derive(Debug, Default, Deserialize)]
pub struct GroupsConfig {
    /// Senders allowed to invite, refuse and welcome, empty for anyone.
    #[serde(default)]
    pub operators: Vec<String>,

    /// Only accept senders from the administrative domains.
    #[serde(default)]
    pub require_local_senders: bool,
}

/// Configuration for the group directory backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum DirectoryConfig {
    /// Directory kept in process memory.
    #[default]
    #[serde(rename = "memory")]
    Memory,

    /// SQLite database file.
    #[serde(rename = "sqlite")]
    Sqlite {
        #[serde(default = "default_database_path")]
        path: String,
    },
}

/// Configuration for the invitation notifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum NotifierConfig {
    /// Invitations are only logged.
    #[default]
    #[serde(rename = "log")]
    Log,

    /// Invitations are relayed through an SMTP server.
    #[serde(rename = "smtp")]
    Smtp {
        #[serde(default = "default_host")]
        relay: String,
        #[serde(default = "default_relay_port")]
        port: u16,
        #[serde(default = "default_from")]
        from: String,
    },
}

/// Invitation configuration.
#[derive(Debug, Default, Deserialize)]
pub struct InviteConfig {
    /// Include a random activation code in invitations.
    #[serde(default)]
    pub activation_code: bool,
}

impl Config {
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            operators: self.groups.operators.clone(),
            activation_code: self.invite.activation_code,
        }
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Loads configuration from a TOML file, using defaults when the file
/// does not exist.
pub fn load_config_or_default(path: &Path) -> ConfigResult<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A parse error occurred deserializing TOML.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2424
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

fn default_required_headers() -> Vec<String> {
    vec!["from".to_string(), "to".to_string()]
}

fn default_database_path() -> String {
    "groupie.db".to_string()
}

fn default_relay_port() -> u16 {
    25
}

fn default_from() -> String {
    "groupie@localhost".to_string()
}

fn default_true() -> bool {
    true
}
