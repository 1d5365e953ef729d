//! Caller identity from request headers
//!
//! Authentication happens in front of this service; the upstream layer
//! forwards the authenticated owner id in `x-owner-id`.

use crate::error::ServeError;
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

pub const OWNER_HEADER: &str = "x-owner-id";

const MAX_OWNER_LEN: usize = 256;

/// Owner id read from the `x-owner-id` header
fn owner_from_headers(headers: &HeaderMap) -> Result<Option<String>, ServeError> {
    let Some(value) = headers.get(OWNER_HEADER) else {
        return Ok(None);
    };
    let owner = value
        .to_str()
        .map_err(|_| ServeError::validation("x-owner-id must be visible ASCII"))?
        .trim();
    if owner.is_empty() {
        return Ok(None);
    }
    if owner.len() > MAX_OWNER_LEN {
        return Err(ServeError::validation(format!(
            "x-owner-id must be at most {} characters",
            MAX_OWNER_LEN
        )));
    }
    Ok(Some(owner.to_string()))
}

/// Required caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ServeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers)?
            .map(Owner)
            .ok_or_else(|| ServeError::Forbidden {
                message: format!("{} header is required", OWNER_HEADER),
            })
    }
}

/// Caller identity when one was supplied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaybeOwner(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeOwner {
    type Rejection = ServeError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers).map(MaybeOwner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_owner_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(owner_from_headers(&headers).unwrap(), None);

        headers.insert(OWNER_HEADER, HeaderValue::from_static("  alice "));
        assert_eq!(owner_from_headers(&headers).unwrap(), Some("alice".to_string()));

        headers.insert(OWNER_HEADER, HeaderValue::from_static(""));
        assert_eq!(owner_from_headers(&headers).unwrap(), None);

        let long = "a".repeat(300);
        headers.insert(OWNER_HEADER, HeaderValue::from_str(&long).unwrap());
        assert!(owner_from_headers(&headers).is_err());
    }
}
