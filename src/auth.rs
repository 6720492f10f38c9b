// Token source seam. Token acquisition itself (OAuth flows, refresh) lives with the caller.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenInfo {
    pub has_token: bool,
    pub status: String,
    pub expires_in: Option<u64>,
    pub refresh_count: u32,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, ApiError>;

    fn get_auth_header(&self, token: &str) -> (String, String) {
        ("Authorization".to_string(), format!("Bearer {token}"))
    }

    // The next `get_token` must not return the current token.
    async fn invalidate_token(&self);

    fn token_info(&self) -> TokenInfo;
}

/// Fixed bearer token. Invalidation clears it until `set_token` is called again.
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String, ApiError> {
        self.token.read().clone().ok_or_else(|| ApiError::Authentication {
            message: "no access token available".to_string(),
            context: Box::default(),
        })
    }

    async fn invalidate_token(&self) {
        *self.token.write() = None;
    }

    fn token_info(&self) -> TokenInfo {
        let has_token = self.token.read().is_some();
        TokenInfo {
            has_token,
            status: if has_token { "valid" } else { "missing" }.to_string(),
            expires_in: None,
            refresh_count: 0,
        }
    }
}
