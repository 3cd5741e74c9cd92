//! Result classifier: extracted JSON to a `ClassificationOutcome`.

use serde_json::Value;

use crate::outcome::{ClassificationOutcome, LocalFailure};

pub const DEFAULT_API_ERROR_MESSAGE: &str = "unknown API error";

/// Classify one extracted JSON object.
///
/// - parse failure: `LocalFailure::Parse` with the parser diagnostic
/// - `error` present: `ApiError` with `error.message`
/// - `candidates` present: `Success` with the first candidate's first text part
/// - otherwise, or when that text is missing: `LocalFailure::NoCandidates`
pub fn classify(json: &[u8]) -> ClassificationOutcome {
    let doc: Value = match serde_json::from_slice(json) {
        Ok(doc) => doc,
        Err(err) => return LocalFailure::Parse(err.to_string()).into(),
    };

    if let Some(error) = doc.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
            .unwrap_or(DEFAULT_API_ERROR_MESSAGE);
        return ClassificationOutcome::ApiError(message.to_string());
    }

    if let Some(candidates) = doc.get("candidates") {
        let text = candidates
            .get(0)
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|parts| parts.get(0))
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str);
        return match text {
            Some(text) => ClassificationOutcome::Success(text.to_string()),
            None => {
                log::debug!("candidates present without a text part");
                LocalFailure::NoCandidates.into()
            }
        };
    }

    LocalFailure::NoCandidates.into()
}
