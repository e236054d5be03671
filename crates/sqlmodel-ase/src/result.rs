//! Outcome of a statement that returns no rows.

use sqlmodel_core::{Error, Result};

/// Receipt for [`AseStatement::exec`](crate::AseStatement::exec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    rows_affected: u64,
}

impl ExecResult {
    pub(crate) const fn new(rows_affected: u64) -> Self {
        Self { rows_affected }
    }

    /// Rows the server reported for the execution; 0 when it reported none.
    pub const fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Always fails: ASE only exposes identity values through
    /// `SELECT @@identity`.
    pub fn last_insert_id(&self) -> Result<i64> {
        Err(Error::Unsupported(
            "last insert id is not supported; query SELECT @@identity instead".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_insert_id_is_unsupported() {
        let result = ExecResult::new(3);
        assert_eq!(result.rows_affected(), 3);
        assert!(matches!(result.last_insert_id(), Err(Error::Unsupported(_))));
        assert_eq!(ExecResult::default().rows_affected(), 0);
    }
}
