//! Result rows from the simple query protocol.

use crate::error::{PgError, PgResult};

/// A row returned from a query. Column values are kept in text format as
/// delivered by the server.
#[derive(Debug)]
pub struct Row {
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn new(raw_values: Vec<Option<&[u8]>>) -> Self {
        let values = raw_values.into_iter().map(|v| v.map(|d| d.to_vec())).collect();
        Self { values }
    }

    /// Number of columns in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a column as a string (text representation). None = SQL NULL.
    pub fn get_str(&self, index: usize) -> PgResult<Option<&str>> {
        let value = self.values.get(index).ok_or_else(|| {
            PgError::TypeConversion(format!("Column index {} out of range", index))
        })?;
        match value {
            None => Ok(None),
            Some(data) => std::str::from_utf8(data)
                .map(Some)
                .map_err(|_| PgError::TypeConversion("Invalid UTF-8".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_access() {
        let row = Row::new(vec![Some(&b"alice"[..]), None]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_str(0).unwrap(), Some("alice"));
        assert_eq!(row.get_str(1).unwrap(), None);
        assert!(row.get_str(2).is_err());
    }
}
