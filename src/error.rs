use thiserror::Error;

/// Errors raised by the analysis service client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network failure, timeout, throttling or a non-success HTTP status.
    #[error("transport error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The completion was not valid JSON or did not match the expected schema.
    #[error("schema validation failed for {schema}: {message}")]
    SchemaValidation { schema: String, message: String },

    /// Retry bound reached; carries the last underlying failure.
    #[error("gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries { attempts: u32, last: Box<LlmError> },

    /// Neither backend has usable credentials configured.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

impl LlmError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn schema(schema: &str, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            schema: schema.to_string(),
            message: message.into(),
        }
    }

    /// Transient model non-compliance is as common as network trouble, so both retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::SchemaValidation { .. })
    }

    /// Stable label written into the audit ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::SchemaValidation { .. } => "schema_validation_error",
            Self::ExhaustedRetries { .. } => "exhausted_retry_error",
            Self::MissingCredentials(_) => "missing_credentials",
        }
    }

    /// The innermost failure, looking through retry exhaustion.
    pub fn root(&self) -> &LlmError {
        match self {
            Self::ExhaustedRetries { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(LlmError::transport("timeout").is_retryable());
        assert!(LlmError::schema("features", "missing field").is_retryable());
        assert!(!LlmError::MissingCredentials("none".into()).is_retryable());

        let exhausted = LlmError::ExhaustedRetries {
            attempts: 3,
            last: Box::new(LlmError::schema("features", "bad enum")),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.kind(), "exhausted_retry_error");
        assert_eq!(exhausted.root().kind(), "schema_validation_error");
    }

    #[test]
    fn test_transport_display_includes_status() {
        let err = LlmError::Transport {
            status: Some(429),
            message: "slow down".into(),
        };
        assert_eq!(err.to_string(), "transport error (HTTP 429): slow down");
        assert_eq!(
            LlmError::transport("reset").to_string(),
            "transport error: reset"
        );
    }
}
