//! Transaction control.

use crate::error::Error;

/// How to end the current unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEndType {
    /// Make the changes permanent.
    Commit,
    /// Discard the changes.
    Rollback,
}

impl TransactionEndType {
    /// The SQL statement that ends the transaction this way.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl TryFrom<&str> for TransactionEndType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase().as_str() {
            "COMMIT" => Ok(Self::Commit),
            "ROLLBACK" => Ok(Self::Rollback),
            _ => Err(Error::usage(format!("TransactionEndType {value} not valid"))),
        }
    }
}

/// Value of the `transaction isolation` connection option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// No commitment control (`*NONE`).
    #[default]
    None,
    /// Read uncommitted (`*CHG`).
    ReadUncommitted,
    /// Read committed (`*CS`).
    ReadCommitted,
    /// Repeatable read (`*ALL`).
    RepeatableRead,
    /// Serializable (`*RR`).
    Serializable,
}

impl IsolationLevel {
    /// Option value understood by the daemon.
    #[must_use]
    pub fn as_option(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::RepeatableRead => "repeatable read",
            Self::Serializable => "serializable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_type_sql() {
        assert_eq!(TransactionEndType::Commit.as_sql(), "COMMIT");
        assert_eq!(TransactionEndType::Rollback.as_sql(), "ROLLBACK");
    }

    #[test]
    fn test_end_type_parse() {
        assert_eq!(
            TransactionEndType::try_from("rollback").ok(),
            Some(TransactionEndType::Rollback)
        );

        let err = TransactionEndType::try_from("SAVEPOINT").err();
        assert_eq!(
            err.map(|e| e.to_string()).as_deref(),
            Some("TransactionEndType SAVEPOINT not valid")
        );
    }

    #[test]
    fn test_isolation_option_values() {
        assert_eq!(IsolationLevel::default().as_option(), "none");
        assert_eq!(IsolationLevel::ReadCommitted.as_option(), "read committed");
    }
}
