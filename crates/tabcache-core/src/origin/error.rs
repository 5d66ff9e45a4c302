use thiserror::Error;

#[derive(Error, Debug)]
pub enum OriginError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for OriginError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            OriginError::InvalidResponse(e.to_string())
        } else {
            OriginError::Network(e.to_string())
        }
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl OriginError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            404 | 410 => OriginError::NotFound(truncated),
            429 => OriginError::RateLimited,
            500..=599 => OriginError::ServerError(truncated),
            _ => OriginError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// The origin answered that the content does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OriginError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(OriginError::from_status(StatusCode::NOT_FOUND, "").is_not_found());
        assert!(matches!(
            OriginError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            OriginError::RateLimited
        ));
        assert!(matches!(
            OriginError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            OriginError::ServerError(ref b) if b == "upstream"
        ));
        assert!(matches!(
            OriginError::from_status(StatusCode::FORBIDDEN, ""),
            OriginError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "é".repeat(400);
        let truncated = OriginError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));

        assert_eq!(OriginError::truncate_body("short"), "short");
    }
}
