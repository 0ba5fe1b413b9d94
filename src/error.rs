//! Relay 에러 타입

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum RelayError {
    /// 업스트림 소켓 유실. 재접속 대상
    #[error("업스트림 연결 끊김: {0}")]
    ConnectionLost(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("저장소 에러: {0}")]
    StorageError(String),

    /// 구독자 세션 하나에만 영향을 주는 에러
    #[error("구독자 에러: {0}")]
    SubscriberError(String),

    #[error("손상된 상태 파일: {0}")]
    MalformedState(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl RelayError {
    /// 재시도하면 회복될 수 있는 에러인지 여부
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::ConnectionLost(_))
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_loss_is_transient() {
        assert!(RelayError::ConnectionLost("reset".to_string()).is_transient());
        assert!(!RelayError::ProtocolError("bad handshake".to_string()).is_transient());
        assert!(!RelayError::StorageError("disk full".to_string()).is_transient());
    }
}
