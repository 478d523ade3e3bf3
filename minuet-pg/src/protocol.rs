//! PostgreSQL v3 wire protocol message definitions.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

/// Backend (server → client) message tag bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendTag {
    AuthenticationRequest = b'R',
    ParameterStatus = b'S',
    BackendKeyData = b'K',
    ReadyForQuery = b'Z',
    RowDescription = b'T',
    DataRow = b'D',
    CommandComplete = b'C',
    ErrorResponse = b'E',
    NoticeResponse = b'N',
    EmptyQueryResponse = b'I',
    NotificationResponse = b'A',
    Unknown = 0,
}

impl From<u8> for BackendTag {
    fn from(b: u8) -> Self {
        match b {
            b'R' => BackendTag::AuthenticationRequest,
            b'S' => BackendTag::ParameterStatus,
            b'K' => BackendTag::BackendKeyData,
            b'Z' => BackendTag::ReadyForQuery,
            b'T' => BackendTag::RowDescription,
            b'D' => BackendTag::DataRow,
            b'C' => BackendTag::CommandComplete,
            b'E' => BackendTag::ErrorResponse,
            b'N' => BackendTag::NoticeResponse,
            b'I' => BackendTag::EmptyQueryResponse,
            b'A' => BackendTag::NotificationResponse,
            _ => BackendTag::Unknown,
        }
    }
}

/// Authentication sub-types from AuthenticationRequest messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Ok = 0,
    CleartextPassword = 3,
    MD5Password = 5,
    SASLInit = 10,
}

impl AuthType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(AuthType::Ok),
            3 => Some(AuthType::CleartextPassword),
            5 => Some(AuthType::MD5Password),
            10 => Some(AuthType::SASLInit),
            _ => None,
        }
    }
}

/// Transaction status indicator from ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' — Idle, not in a transaction.
    Idle,
    /// 'T' — In a transaction block.
    InTransaction,
    /// 'E' — In a failed transaction block.
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}
