//! Structured errors recorded on runs and steps

use serde::{Deserialize, Serialize};

/// Error codes the engine itself attaches to failures.
pub mod codes {
    /// The event log contradicts the replayed workflow body.
    pub const WORKFLOW_RUNTIME_ERROR: &str = "WORKFLOW_RUNTIME_ERROR";

    /// A step ran out of retry attempts.
    pub const RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";

    /// The workflow name in the run is not registered.
    pub const WORKFLOW_NOT_REGISTERED: &str = "WORKFLOW_NOT_REGISTERED";

    /// The step name in the message is not registered.
    pub const STEP_NOT_REGISTERED: &str = "STEP_NOT_REGISTERED";

    /// A hook was disposed while the workflow was still waiting on it.
    pub const HOOK_DISPOSED: &str = "HOOK_DISPOSED";
}

/// The structured failure surface on [`Run`](crate::Run) and
/// [`Step`](crate::Step) entities.
///
/// The wire format permits both the structured JSON form and the legacy
/// plain-string form; deserialization accepts either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Whether this error carries the given engine code.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {}

impl From<String> for ErrorInfo {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorInfoWire {
    Structured {
        message: String,
        #[serde(default)]
        stack: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Legacy(String),
}

impl<'de> Deserialize<'de> for ErrorInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match ErrorInfoWire::deserialize(deserializer)? {
            ErrorInfoWire::Structured {
                message,
                stack,
                code,
            } => ErrorInfo {
                message,
                stack,
                code,
            },
            ErrorInfoWire::Legacy(message) => ErrorInfo::new(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_round_trip() {
        let error = ErrorInfo::new("boom")
            .with_code(codes::WORKFLOW_RUNTIME_ERROR)
            .with_stack("at replay");

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }

    #[test]
    fn test_legacy_plain_string() {
        let parsed: ErrorInfo = serde_json::from_str("\"it broke\"").unwrap();
        assert_eq!(parsed.message, "it broke");
        assert_eq!(parsed.code, None);
        assert_eq!(parsed.stack, None);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_string(&ErrorInfo::new("x")).unwrap();
        assert_eq!(json, r#"{"message":"x"}"#);
    }

    #[test]
    fn test_display_includes_code() {
        let error = ErrorInfo::new("nope").with_code("DENIED");
        assert_eq!(error.to_string(), "nope (DENIED)");
    }
}
