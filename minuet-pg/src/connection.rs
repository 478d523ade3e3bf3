//! Blocking PgConnection — connects, authenticates, and runs simple queries.
//!
//! Synchronous by design: connections live in a free list guarded by the
//! server's pool, and a worker that checks one out is allowed to block on it.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::codec;
use crate::error::{PgError, PgResult};
use crate::protocol::{AuthType, BackendTag, TransactionStatus};
use crate::row::Row;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl PgConfig {
    pub fn new(host: &str, port: u16, user: &str, password: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
        }
    }
}

/// A synchronous PostgreSQL connection speaking the simple query protocol.
pub struct PgConnection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    read_pos: usize,
    tx_status: TransactionStatus,
}

impl PgConnection {
    /// Connect to PostgreSQL and complete authentication.
    pub fn connect(config: &PgConfig) -> PgResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).map_err(PgError::Io)?;

        let mut conn = Self {
            stream,
            read_buf: vec![0u8; READ_BUF_SIZE],
            write_buf: Vec::with_capacity(1024),
            read_pos: 0,
            tx_status: TransactionStatus::Idle,
        };

        conn.startup(config)?;
        Ok(conn)
    }

    /// Perform the startup and authentication handshake.
    fn startup(&mut self, config: &PgConfig) -> PgResult<()> {
        codec::encode_startup(&mut self.write_buf, &config.user, &config.database);
        self.stream.write_all(&self.write_buf).map_err(PgError::Io)?;

        loop {
            if codec::message_complete(&self.read_buf[..self.read_pos]).is_none() {
                self.fill_read_buf()?;
            }

            while let Some(msg_len) = codec::message_complete(&self.read_buf[..self.read_pos]) {
                let header = codec::decode_header(&self.read_buf)
                    .ok_or_else(|| PgError::Protocol("truncated header".to_string()))?;
                let body = &self.read_buf[5..msg_len];

                match header.tag {
                    BackendTag::AuthenticationRequest => {
                        let auth_type = codec::read_i32(body, 0);
                        match AuthType::from_i32(auth_type) {
                            Some(AuthType::Ok) => {
                                // Authenticated; keep reading to ReadyForQuery.
                            }
                            Some(AuthType::CleartextPassword) => {
                                codec::encode_password(&mut self.write_buf, &config.password);
                                self.stream.write_all(&self.write_buf).map_err(PgError::Io)?;
                            }
                            _ => {
                                return Err(PgError::Auth(format!(
                                    "Unsupported auth type {}; configure password auth",
                                    auth_type
                                )));
                            }
                        }
                    }
                    BackendTag::ParameterStatus | BackendTag::BackendKeyData => {
                        // Session parameters and the cancel key are not used.
                    }
                    BackendTag::ReadyForQuery => {
                        self.tx_status = TransactionStatus::from(body[0]);
                        self.consume_read(msg_len);
                        return Ok(());
                    }
                    BackendTag::ErrorResponse => {
                        return Err(parse_error(body));
                    }
                    _ => {}
                }
                self.consume_read(msg_len);
            }
        }
    }

    /// Execute a simple query (no parameters). Returns all result rows.
    pub fn query_simple(&mut self, sql: &str) -> PgResult<Vec<Row>> {
        codec::encode_query(&mut self.write_buf, sql);
        self.stream.write_all(&self.write_buf).map_err(PgError::Io)?;
        self.read_query_results()
    }

    /// Execute a statement that returns no rows (INSERT, UPDATE, DELETE).
    pub fn execute_simple(&mut self, sql: &str) -> PgResult<()> {
        self.query_simple(sql)?;
        Ok(())
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    fn fill_read_buf(&mut self) -> PgResult<()> {
        if self.read_pos >= self.read_buf.len() {
            return Err(PgError::Protocol("message exceeds read buffer".to_string()));
        }
        let n = self
            .stream
            .read(&mut self.read_buf[self.read_pos..])
            .map_err(PgError::Io)?;
        if n == 0 {
            return Err(PgError::ConnectionClosed);
        }
        self.read_pos += n;
        Ok(())
    }

    fn consume_read(&mut self, n: usize) {
        self.read_buf.copy_within(n..self.read_pos, 0);
        self.read_pos -= n;
    }

    fn read_query_results(&mut self) -> PgResult<Vec<Row>> {
        let mut rows = Vec::new();
        let mut pending_err: Option<PgError> = None;

        loop {
            if codec::message_complete(&self.read_buf[..self.read_pos]).is_none() {
                self.fill_read_buf()?;
            }

            while let Some(msg_len) = codec::message_complete(&self.read_buf[..self.read_pos]) {
                let header = codec::decode_header(&self.read_buf)
                    .ok_or_else(|| PgError::Protocol("truncated header".to_string()))?;
                let body = &self.read_buf[5..msg_len];

                match header.tag {
                    BackendTag::RowDescription => {}
                    BackendTag::DataRow => {
                        rows.push(Row::new(codec::parse_data_row(body)));
                    }
                    BackendTag::CommandComplete
                    | BackendTag::EmptyQueryResponse
                    | BackendTag::NoticeResponse => {}
                    BackendTag::ReadyForQuery => {
                        self.tx_status = TransactionStatus::from(body[0]);
                        self.consume_read(msg_len);
                        return match pending_err {
                            Some(e) => Err(e),
                            None => Ok(rows),
                        };
                    }
                    BackendTag::ErrorResponse => {
                        // Remember the error and keep draining to ReadyForQuery
                        // so the connection stays usable.
                        pending_err = Some(parse_error(body));
                    }
                    _ => {}
                }
                self.consume_read(msg_len);
            }
        }
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        codec::encode_terminate(&mut self.write_buf);
        let _ = self.stream.write_all(&self.write_buf);
    }
}

fn parse_error(body: &[u8]) -> PgError {
    let fields = codec::parse_error_fields(body);
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();
    for (field_type, value) in fields {
        match field_type {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    PgError::Server {
        severity,
        code,
        message,
    }
}
