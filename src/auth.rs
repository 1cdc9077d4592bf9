use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde_json::json;

pub fn verify_bearer(
    headers: &HeaderMap,
    expected_key: &str,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let token = extract_bearer_token(headers)?;

    if token.trim() != expected_key {
        return Err(unauthorized("Invalid API key"));
    }

    Ok(())
}

pub fn extract_bearer_token(
    headers: &HeaderMap,
) -> Result<&str, (StatusCode, Json<serde_json::Value>)> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(unauthorized("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(unauthorized("Invalid Authorization header"));
    };

    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Authorization must use Bearer token"))
}

fn unauthorized(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": message
            }
        })),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, StatusCode};

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_matching_bearer() {
        assert!(verify_bearer(&headers("Bearer s3cret"), "s3cret").is_ok());
    }

    #[test]
    fn rejects_missing_wrong_or_non_bearer() {
        for headers in [HeaderMap::new(), headers("Bearer nope"), headers("Basic s3cret")] {
            let (status, _) = verify_bearer(&headers, "s3cret").unwrap_err();
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
    }
}
