use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token rejected by auth service: {0}")]
    Rejected(String),
}

/// Account the token belongs to, per the legacy login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
}

/// Client for the legacy login endpoint derived from the ee2 URL.
pub struct AuthClient {
    http: reqwest::Client,
    url: String,
}

impl AuthClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Validate a token, returning the account it belongs to.
    pub async fn validate(&self, token: &str) -> Result<UserInfo, AuthError> {
        let response = self
            .http
            .post(&self.url)
            .form(&[("token", token), ("fields", "user_id")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!("HTTP {status}: {body}")));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_info_parsing() {
        let info: UserInfo =
            serde_json::from_str(r#"{"user_id":"someuser","token_id":"ignored"}"#).unwrap();
        assert_eq!(info.user_id, "someuser");
    }
}
