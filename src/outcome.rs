//! Classification outcomes.
//!
//! Every pipeline run ends in exactly one `ClassificationOutcome`. Failures are
//! data, never aborts: a failed run yields an outcome and the controller is
//! ready for the next trigger.

/// Locally detected failure, one per pipeline phase that can go wrong.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalFailure {
    Capture,
    Storage,
    Encoding,
    Connection,
    HeaderTimeout,
    EmptyResponse,
    NoJson,
    ResponseTooLarge,
    Parse(String),
    NoCandidates,
}

impl LocalFailure {
    /// Stable reason code.
    pub fn code(&self) -> String {
        match self {
            Self::Capture => "capture".to_string(),
            Self::Storage => "storage".to_string(),
            Self::Encoding => "encoding".to_string(),
            Self::Connection => "connection".to_string(),
            Self::HeaderTimeout => "header-timeout".to_string(),
            Self::EmptyResponse => "empty-response".to_string(),
            Self::NoJson => "no-json".to_string(),
            Self::ResponseTooLarge => "response-too-large".to_string(),
            Self::Parse(detail) => format!("parse:{}", detail),
            Self::NoCandidates => "no-candidates".to_string(),
        }
    }
}

impl std::fmt::Display for LocalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture => write!(f, "Capture failed"),
            Self::Storage => write!(f, "Failed to store image file"),
            Self::Encoding => write!(f, "Memory allocation failed"),
            Self::Connection => write!(f, "Connection failed"),
            Self::HeaderTimeout => write!(f, "Timeout waiting for API headers"),
            Self::EmptyResponse => write!(f, "Empty response"),
            Self::NoJson => write!(f, "No JSON found"),
            Self::ResponseTooLarge => write!(f, "Response too large"),
            Self::Parse(detail) => write!(f, "Failed to parse response: {}", detail),
            Self::NoCandidates => write!(f, "No valid response found"),
        }
    }
}

impl std::error::Error for LocalFailure {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassificationOutcome {
    Success(String),
    ApiError(String),
    LocalFailure(LocalFailure),
}

impl ClassificationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Short machine-readable kind, used by the status endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::ApiError(_) => "api_error",
            Self::LocalFailure(_) => "local_failure",
        }
    }

    pub fn reason_code(&self) -> Option<String> {
        match self {
            Self::LocalFailure(failure) => Some(failure.code()),
            _ => None,
        }
    }
}

impl From<LocalFailure> for ClassificationOutcome {
    fn from(failure: LocalFailure) -> Self {
        Self::LocalFailure(failure)
    }
}

impl std::fmt::Display for ClassificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(text) => write!(f, "{}", text),
            Self::ApiError(message) => write!(f, "API Error: {}", message),
            Self::LocalFailure(failure) => write!(f, "{}", failure),
        }
    }
}
