//! Configuration types.
//!
//! Values come from three layers, later ones winning:
//! 1. the shared JSON config file (`agent_config.json` by default);
//! 2. `AGENT_*` environment variables;
//! 3. command-line flags (applied by the binary).
//!
//! A missing or unreadable config file is not an error; defaults are used.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "agent_config.json";

/// IMAP connection and marker settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Login name; empty means the agent's own address.
    pub username: String,
    pub password: SecretString,
    /// Mailbox the agent polls.
    pub mailbox: String,
    /// IMAP keyword that marks a message as claimed.
    pub claim_keyword: String,
    /// Use CONDSTORE conditional stores for claims when the server supports it.
    pub condstore: bool,
    /// Socket read/write timeout.
    pub timeout: Duration,
}

/// SMTP settings for outbound mail.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Login name; empty means the agent's own address.
    pub username: String,
    pub password: SecretString,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address of the mailbox this agent reads and sends from.
    pub agent_email: String,
    /// Pause between poll cycles.
    pub check_interval: Duration,
    /// Maximum messages claimed per poll cycle.
    pub max_messages: usize,
    /// Extra attempts for an idempotent marker commit before giving up.
    pub mark_retries: u32,
    pub imap: Option<ImapConfig>,
    pub smtp: Option<SmtpConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_email: String::new(),
            check_interval: Duration::from_secs(60),
            max_messages: 10,
            mark_retries: 2,
            imap: None,
            smtp: None,
        }
    }
}

/// On-disk shape of the config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    agent_email: Option<String>,
    #[serde(alias = "check_interval_secs")]
    check_interval: Option<u64>,
    max_messages: Option<usize>,
    mark_retries: Option<u32>,
    #[serde(default)]
    imap: FileImap,
    #[serde(default)]
    smtp: FileSmtp,
}

#[derive(Debug, Default, Deserialize)]
struct FileImap {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    mailbox: Option<String>,
    claim_keyword: Option<String>,
    condstore: Option<bool>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSmtp {
    host: Option<String>,
    port: Option<u16>,
}

/// Read an environment variable, treating empty values as unset.
fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

impl AgentConfig {
    /// Load the config file at `path` (if present) and apply environment
    /// overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = Self::read_file(path.as_ref());
        Self::from_file_config(file)
    }

    /// Parse a config file, falling back to defaults when it is missing or
    /// malformed.
    fn read_file(path: &Path) -> FileConfig {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Could not read config file: {e}; using defaults");
                return FileConfig::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(file) => {
                tracing::info!(path = %path.display(), "Loaded configuration");
                file
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Invalid config file: {e}; using defaults");
                FileConfig::default()
            }
        }
    }

    fn from_file_config(file: FileConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let agent_email = env("AGENT_EMAIL")
            .or(file.agent_email)
            .unwrap_or_default();

        let check_interval = env_parse::<u64>("AGENT_CHECK_INTERVAL_SECS")?
            .or(file.check_interval)
            .map(Duration::from_secs)
            .unwrap_or(defaults.check_interval);

        let max_messages = env_parse::<usize>("AGENT_MAX_MESSAGES")?
            .or(file.max_messages)
            .unwrap_or(defaults.max_messages);

        let mark_retries = env_parse::<u32>("AGENT_MARK_RETRIES")?
            .or(file.mark_retries)
            .unwrap_or(defaults.mark_retries);

        let imap = match env("AGENT_IMAP_HOST").or(file.imap.host) {
            Some(host) => {
                let username = env("AGENT_IMAP_USERNAME")
                    .or(file.imap.username)
                    .unwrap_or_default();
                let password = env("AGENT_EMAIL_PASSWORD")
                    .or(file.imap.password)
                    .unwrap_or_default();
                Some(ImapConfig {
                    port: env_parse::<u16>("AGENT_IMAP_PORT")?
                        .or(file.imap.port)
                        .unwrap_or(993),
                    username,
                    password: SecretString::from(password),
                    mailbox: env("AGENT_IMAP_MAILBOX")
                        .or(file.imap.mailbox)
                        .unwrap_or_else(|| "INBOX".to_string()),
                    claim_keyword: env("AGENT_CLAIM_KEYWORD")
                        .or(file.imap.claim_keyword)
                        .unwrap_or_else(|| "agent-processing".to_string()),
                    condstore: env_parse::<bool>("AGENT_IMAP_CONDSTORE")?
                        .or(file.imap.condstore)
                        .unwrap_or(true),
                    timeout: Duration::from_secs(file.imap.timeout_secs.unwrap_or(30)),
                    host,
                })
            }
            None => None,
        };

        let smtp = imap.as_ref().map(|imap| -> Result<SmtpConfig, ConfigError> {
            Ok(SmtpConfig {
                host: env("AGENT_SMTP_HOST")
                    .or(file.smtp.host.clone())
                    .unwrap_or_else(|| imap.host.replace("imap", "smtp")),
                port: env_parse::<u16>("AGENT_SMTP_PORT")?
                    .or(file.smtp.port)
                    .unwrap_or(587),
                username: imap.username.clone(),
                password: imap.password.clone(),
            })
        });

        let config = Self {
            agent_email,
            check_interval,
            max_messages,
            mark_retries,
            imap,
            smtp: smtp.transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that would otherwise fail later at the transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_messages".into(),
                message: "must be at least 1".into(),
            });
        }
        if let Some(imap) = &self.imap {
            validate_keyword(&imap.claim_keyword)?;
        }
        Ok(())
    }

    /// The agent's own address, which must be set before anything runs.
    pub fn require_agent_email(&self) -> Result<&str, ConfigError> {
        if self.agent_email.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "agent email".into(),
                hint: "Pass --email or set AGENT_EMAIL.".into(),
            });
        }
        Ok(&self.agent_email)
    }

    /// IMAP settings with the login name resolved against the current
    /// agent address.
    pub fn require_imap(&self) -> Result<ImapConfig, ConfigError> {
        let imap = self.imap.as_ref().ok_or_else(|| ConfigError::MissingRequired {
            key: "imap.host".into(),
            hint: "Set imap.host in the config file or AGENT_IMAP_HOST.".into(),
        })?;
        Ok(ImapConfig {
            username: self.login_name(&imap.username),
            ..imap.clone()
        })
    }

    pub fn require_smtp(&self) -> Result<SmtpConfig, ConfigError> {
        let smtp = self.smtp.as_ref().ok_or_else(|| ConfigError::MissingRequired {
            key: "smtp.host".into(),
            hint: "Set smtp.host in the config file or AGENT_SMTP_HOST.".into(),
        })?;
        Ok(SmtpConfig {
            username: self.login_name(&smtp.username),
            ..smtp.clone()
        })
    }

    fn login_name(&self, configured: &str) -> String {
        if configured.is_empty() {
            self.agent_email.clone()
        } else {
            configured.to_string()
        }
    }
}

/// IMAP keywords are atoms: no spaces, quotes, parentheses or wildcards.
fn validate_keyword(keyword: &str) -> Result<(), ConfigError> {
    let invalid = keyword.is_empty()
        || keyword.starts_with('\\')
        || keyword
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "(){%*\"\\]".contains(c));
    if invalid {
        return Err(ConfigError::InvalidValue {
            key: "imap.claim_keyword".into(),
            message: format!("{keyword:?} is not a valid IMAP keyword"),
        });
    }
    Ok(())
}
