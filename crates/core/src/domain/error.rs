use serde::Serialize;

/// オーケストレータ共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "E_VALIDATION")]
    Validation,
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_STORAGE")]
    Storage,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

/// アプリケーションエラー（トランスポート層へそのまま返せる形）
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl AppError {
    /// 投入内容の不備。ステータスとしては永続化しない。
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Storage,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}
