//! Response classification
//!
//! Categorizes each framed inbound line. grblHAL responses carry no request
//! id; correlation happens downstream in the correlator, this module only
//! decides what kind of line arrived.

use serde::{Deserialize, Serialize};

/// A classified inbound protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Acknowledgement of a non-status command (`ok`).
    Ok,
    /// Rejection of a non-status command (`error:<code>`).
    Error(ErrorCode),
    /// Status report, delimited by `<...>`; raw text retained for parsing.
    Status(String),
    /// Anything else: welcome banners, alarm lines, setting dumps.
    Unsolicited(String),
}

/// Error code from an `error:` line. Typically numeric, but treated as opaque
/// text when the controller sends something else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Numeric code as documented in the grbl error table.
    Numeric(u16),
    /// Non-numeric code, kept verbatim.
    Text(String),
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Numeric(code) => write!(f, "{code}"),
            ErrorCode::Text(text) => write!(f, "{text}"),
        }
    }
}

impl Response {
    /// Classify a framed line.
    ///
    /// Checked in order: exact `ok`, `error:` prefix, `<` prefix, catch-all.
    /// The protocol's alphabet keeps these disjoint, so the ordering is for
    /// clarity rather than correctness.
    pub fn classify(line: &str) -> Response {
        if line == "ok" {
            return Response::Ok;
        }
        if let Some(code) = line.strip_prefix("error:") {
            let code = match code.trim().parse::<u16>() {
                Ok(n) => ErrorCode::Numeric(n),
                Err(_) => ErrorCode::Text(code.trim().to_string()),
            };
            return Response::Error(code);
        }
        if line.starts_with('<') {
            return Response::Status(line.to_string());
        }
        Response::Unsolicited(line.to_string())
    }

    /// True for `ok`/`error:` lines, the responses that complete a non-status
    /// command.
    pub fn is_acknowledgement(&self) -> bool {
        matches!(self, Response::Ok | Response::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ok() {
        assert_eq!(Response::classify("ok"), Response::Ok);
        // Not an exact match: falls through to unsolicited.
        assert_eq!(
            Response::classify("okay"),
            Response::Unsolicited("okay".to_string())
        );
    }

    #[test]
    fn test_classify_numeric_error() {
        assert_eq!(
            Response::classify("error:9"),
            Response::Error(ErrorCode::Numeric(9))
        );
        assert_eq!(
            Response::classify("error:20"),
            Response::Error(ErrorCode::Numeric(20))
        );
    }

    #[test]
    fn test_classify_non_numeric_error_is_opaque_text() {
        assert_eq!(
            Response::classify("error:limit"),
            Response::Error(ErrorCode::Text("limit".to_string()))
        );
    }

    #[test]
    fn test_classify_status_report() {
        assert_eq!(
            Response::classify("<Idle|WPos:0.000,0.000,0.000>"),
            Response::Status("<Idle|WPos:0.000,0.000,0.000>".to_string())
        );
    }

    #[test]
    fn test_classify_unsolicited() {
        assert_eq!(
            Response::classify("Grbl 1.1h ['$' for help]"),
            Response::Unsolicited("Grbl 1.1h ['$' for help]".to_string())
        );
        assert_eq!(
            Response::classify("ALARM:1"),
            Response::Unsolicited("ALARM:1".to_string())
        );
    }

    #[test]
    fn test_is_acknowledgement() {
        assert!(Response::classify("ok").is_acknowledgement());
        assert!(Response::classify("error:2").is_acknowledgement());
        assert!(!Response::classify("<Idle>").is_acknowledgement());
        assert!(!Response::classify("$0=10").is_acknowledgement());
    }
}
