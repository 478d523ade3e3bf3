//! Binary codec for the PostgreSQL v3 wire protocol.
//!
//! Encoding appends to a caller-provided `Vec<u8>`; decoding slices directly
//! from the read buffer.

use crate::protocol::BackendTag;

// ─── Encoding (Frontend → Server) ─────────────────────────────

/// Encode a StartupMessage.
///
/// Format: Int32(len) Int32(196608=v3.0) { CString(param) CString(value) }* \0
pub fn encode_startup(buf: &mut Vec<u8>, user: &str, database: &str) {
    buf.clear();
    buf.extend_from_slice(&[0, 0, 0, 0]); // length backfilled below
    buf.extend_from_slice(&196608i32.to_be_bytes());
    put_cstring(buf, "user");
    put_cstring(buf, user);
    put_cstring(buf, "database");
    put_cstring(buf, database);
    buf.push(0);
    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
}

/// Encode a PasswordMessage ('p') carrying a cleartext password.
pub fn encode_password(buf: &mut Vec<u8>, password: &str) {
    buf.clear();
    buf.push(b'p');
    let len = 4 + password.len() + 1;
    buf.extend_from_slice(&(len as i32).to_be_bytes());
    put_cstring(buf, password);
}

/// Encode a simple Query message ('Q').
pub fn encode_query(buf: &mut Vec<u8>, sql: &str) {
    buf.clear();
    buf.push(b'Q');
    let len = 4 + sql.len() + 1;
    buf.extend_from_slice(&(len as i32).to_be_bytes());
    put_cstring(buf, sql);
}

/// Encode a Terminate message ('X').
pub fn encode_terminate(buf: &mut Vec<u8>) {
    buf.clear();
    buf.push(b'X');
    buf.extend_from_slice(&4i32.to_be_bytes());
}

// ─── Decoding (Server → Frontend) ─────────────────────────────

/// A decoded backend message header.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub tag: BackendTag,
    /// Length including the 4-byte length field but excluding the tag byte.
    pub length: u32,
}

/// Try to read a backend message header from `buf`.
/// Returns None if fewer than 5 bytes are available.
pub fn decode_header(buf: &[u8]) -> Option<MessageHeader> {
    if buf.len() < 5 {
        return None;
    }
    Some(MessageHeader {
        tag: BackendTag::from(buf[0]),
        length: read_u32(buf, 1),
    })
}

/// Check whether a complete message is available in `buf`.
/// Returns the total message size (tag + body) when it is.
pub fn message_complete(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    let total = 1 + read_u32(buf, 1) as usize;
    if buf.len() >= total {
        Some(total)
    } else {
        None
    }
}

/// Read an i32 from a backend message body.
pub fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Read a u32 from a backend message body.
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Read an i16 from a backend message body.
pub fn read_i16(buf: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read a C-string from `buf[offset..]`.
/// Returns the string slice and bytes consumed (including the terminator).
pub fn read_cstring(buf: &[u8], offset: usize) -> (&str, usize) {
    let start = offset;
    let mut end = start;
    while end < buf.len() && buf[end] != 0 {
        end += 1;
    }
    let s = std::str::from_utf8(&buf[start..end]).unwrap_or("");
    (s, end - start + 1)
}

/// Parse an ErrorResponse or NoticeResponse body into (field_type, value)
/// pairs.
pub fn parse_error_fields(body: &[u8]) -> Vec<(u8, String)> {
    let mut fields = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let field_type = body[pos];
        pos += 1;
        if field_type == 0 {
            break;
        }
        let (value, consumed) = read_cstring(body, pos);
        fields.push((field_type, value.to_string()));
        pos += consumed;
    }
    fields
}

/// Parse a DataRow body into column byte slices (None = SQL NULL).
pub fn parse_data_row(body: &[u8]) -> Vec<Option<&[u8]>> {
    let num_columns = read_i16(body, 0) as usize;
    let mut columns = Vec::with_capacity(num_columns);
    let mut pos = 2;

    for _ in 0..num_columns {
        let len = read_i32(body, pos);
        pos += 4;
        if len < 0 {
            columns.push(None);
        } else {
            let len = len as usize;
            columns.push(Some(&body[pos..pos + len]));
            pos += len;
        }
    }
    columns
}

fn put_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_encoding() {
        let mut buf = Vec::new();
        encode_startup(&mut buf, "postgres", "mydb");
        // Protocol version at offset 4, length prefix covers the whole message.
        assert_eq!(read_i32(&buf, 4), 196608);
        assert_eq!(read_i32(&buf, 0) as usize, buf.len());
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn query_encoding() {
        let mut buf = Vec::new();
        encode_query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], b'Q');
        assert_eq!(read_i32(&buf, 1) as usize, buf.len() - 1);
        assert_eq!(&buf[5..13], b"SELECT 1");
    }

    #[test]
    fn password_encoding() {
        let mut buf = Vec::new();
        encode_password(&mut buf, "hunter2");
        assert_eq!(buf[0], b'p');
        assert_eq!(&buf[5..12], b"hunter2");
        assert_eq!(buf[12], 0);
    }

    #[test]
    fn message_complete_boundaries() {
        // tag(1) + length(4) = 5 bytes minimum
        let msg = [b'Z', 0, 0, 0, 5, b'I'];
        assert_eq!(message_complete(&msg), Some(6));
        assert_eq!(message_complete(&msg[..4]), None);
        assert_eq!(message_complete(&msg[..5]), None);
    }

    #[test]
    fn data_row_parsing() {
        // 2 columns: "alice", NULL
        let mut body = Vec::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&5i32.to_be_bytes());
        body.extend_from_slice(b"alice");
        body.extend_from_slice(&(-1i32).to_be_bytes());

        let cols = parse_data_row(&body);
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0], Some(&b"alice"[..]));
        assert_eq!(cols[1], None);
    }

    #[test]
    fn error_fields_parsing() {
        let mut body = Vec::new();
        body.push(b'S');
        body.extend_from_slice(b"ERROR\0");
        body.push(b'M');
        body.extend_from_slice(b"boom\0");
        body.push(0);

        let fields = parse_error_fields(&body);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], (b'S', "ERROR".to_string()));
        assert_eq!(fields[1], (b'M', "boom".to_string()));
    }
}
