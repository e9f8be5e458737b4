use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::api::ApiError;

/// Returns the caller's bearer token once it matches the configured API key.
/// The token doubles as the caller's rate-limit key.
pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<String, ApiError> {
    let token = bearer_token(headers)?.trim();
    if token != expected_key {
        return Err(ApiError::unauthorized("Invalid API key"));
    }
    Ok(token.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| ApiError::unauthorized("Invalid Authorization header"))?;

    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("Authorization must use Bearer token"))
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, StatusCode};

    use super::*;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn matching_token_is_returned() {
        let token = verify_bearer(&headers("Bearer key-1 "), "key-1").expect("authorized");
        assert_eq!(token, "key-1");
    }

    #[test]
    fn missing_malformed_and_wrong_tokens_are_rejected() {
        for headers in [HeaderMap::new(), headers("Basic abc"), headers("Bearer other")] {
            let err = verify_bearer(&headers, "key-1").expect_err("rejected");
            assert_eq!(err.status, StatusCode::UNAUTHORIZED);
            assert_eq!(err.code, "UNAUTHORIZED");
        }
    }
}
