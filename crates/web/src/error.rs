use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("{message}")]
    RateLimited {
        message: &'static str,
        retry_after_secs: u64,
        /// Set for the login class, which advertises its limit.
        limit: Option<u32>,
    },
    #[error("{cause:#}")]
    Internal {
        cause: anyhow::Error,
        /// Show the error chain to the client (non-production only).
        expose: bool,
    },
}

impl ApiError {
    pub fn internal(cause: impl Into<anyhow::Error>, expose: bool) -> Self {
        Self::Internal {
            cause: cause.into(),
            expose,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized | Self::InvalidPassword => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal { cause, expose } => {
                tracing::error!(error = %format!("{cause:#}"), "request failed");
                if *expose {
                    format!("{cause:#}")
                } else {
                    "Internal server error".to_string()
                }
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(serde_json::json!({ "error": message }))).into_response();
        if let Self::RateLimited {
            retry_after_secs,
            limit,
            ..
        } = self
        {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            if let Some(limit) = limit {
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_internal_error_hidden_in_production() {
        let err = anyhow::anyhow!("no such table: markets").context("loading leaderboard");
        let response = ApiError::internal(err, false).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_internal_error_exposed_in_development() {
        let err = anyhow::anyhow!("no such table: markets").context("loading leaderboard");
        let response = ApiError::internal(err, true).into_response();
        let body = body_json(response).await;
        let msg = body["error"].as_str().unwrap();
        assert!(msg.contains("loading leaderboard"));
        assert!(msg.contains("no such table"));
    }

    #[tokio::test]
    async fn test_rate_limited_headers() {
        let response = ApiError::RateLimited {
            message: "Too many login attempts. Please try again later.",
            retry_after_secs: 42,
            limit: Some(5),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[tokio::test]
    async fn test_unauthorized_is_generic() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Unauthorized");
    }
}
