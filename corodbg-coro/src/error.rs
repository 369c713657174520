//! 解析エラー

use thiserror::Error;

/// ランタイム解析のエラー
///
/// どれもコマンド単位で回復可能で、セッションは継続します。
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("No symbol \"{0}\" in current context")]
    SymbolNotFound(String),

    #[error("There is no member named {field} in {ty}")]
    FieldNotFound { ty: String, field: String },

    #[error("No type named {0}")]
    TypeNotFound(String),

    #[error("No such thread: {0}")]
    ThreadNotFound(String),

    #[error("No such coroutine: {id} (thread {thread})")]
    CoroutineNotFound { thread: String, id: String },

    #[error("Unsupported architecture for coroutine context: {0}")]
    UnsupportedArchitecture(String),

    #[error("Malformed runtime state: {0}")]
    MalformedRuntimeState(String),

    #[error("Coroutine {0} is running; its saved context is stale")]
    CoroutineRunning(u64),

    #[error("{0} is not a pointer")]
    NotAPointer(String),

    #[error("{0} is not a struct or union")]
    NotAggregate(String),

    #[error("Cannot access memory at address 0x{address:x}: {reason}")]
    MemoryRead { address: u64, reason: String },
}

impl InspectError {
    pub(crate) fn memory(address: u64, err: anyhow::Error) -> Self {
        InspectError::MemoryRead {
            address,
            reason: err.to_string(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        InspectError::MalformedRuntimeState(message.into())
    }
}

/// 解析の結果型
pub type Result<T> = std::result::Result<T, InspectError>;
