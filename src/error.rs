//! Error types for the mailqueue agent.

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by a mailbox transport.
///
/// Every transport call is an independent remote operation; none of these are
/// retried inside the transport itself.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("{command} rejected by server: {response}")]
    Rejected { command: String, response: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to send message to {recipient}: {reason}")]
    SendFailed { recipient: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Message codec error: {0}")]
    Codec(#[from] MessageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors building, encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Payload could not be serialized: {0}")]
    Encode(serde_json::Error),

    #[error("Invalid JSON: {0}")]
    Decode(serde_json::Error),

    #[error("Malformed email: {0}")]
    MalformedEmail(String),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_message_includes_hint() {
        let err = ConfigError::MissingRequired {
            key: "agent email".into(),
            hint: "Pass --email or set AGENT_EMAIL.".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required configuration: agent email. Pass --email or set AGENT_EMAIL."
        );
    }

    #[test]
    fn invalid_config_value_converts_into_top_level() {
        let err: Error = ConfigError::InvalidValue {
            key: "max_messages".into(),
            message: "must be at least 1".into(),
        }
        .into();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue { .. })));
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration value for max_messages: must be at least 1"
        );
    }

    #[test]
    fn decode_error_converts_into_top_level() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = MessageError::Decode(json_err).into();
        assert!(matches!(err, Error::Message(MessageError::Decode(_))));
        assert!(err.to_string().starts_with("Message error: Invalid JSON"));
    }

    #[test]
    fn transport_error_wraps_codec_failures() {
        let err: TransportError = MessageError::MalformedEmail("no headers".into()).into();
        assert_eq!(
            err.to_string(),
            "Message codec error: Malformed email: no headers"
        );
    }
}
