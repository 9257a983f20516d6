// ====================================================================================
// src/identity.rs - 调用方身份
// ====================================================================================
use crate::error::AppError;
use axum::http::HeaderMap;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const DISPLAY_NAME_HEADER: &str = "X-Display-Name";
const ANONYMOUS: &str = "Anonymous";

// 已解析的调用方身份；核心操作只接受该类型，未认证的调用无法进入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    user_id: String,
    display_name: String,
}

impl Identity {
    pub fn new(user_id: &str, display_name: Option<&str>) -> Result<Self, AppError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::Unauthenticated);
        }
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(ANONYMOUS);
        Ok(Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        })
    }

    // 从请求头解析身份，认证本身由上游网关完成
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AppError> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthenticated)?;
        let display_name = headers.get(DISPLAY_NAME_HEADER).and_then(|v| v.to_str().ok());
        Self::new(user_id, display_name)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}
