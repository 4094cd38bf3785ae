//! Row-lock configuration for SQL stores

/// Transaction isolation level for the row-lock strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Statement applied right after the transaction opens
    pub fn set_statement(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Emits the native pessimistic-lock query for the state row.
///
/// The query must select the full `outbox_states` row by a single `$1`
/// outbox-id parameter and take an exclusive row lock.
pub trait LockStatementProvider: Send + Sync {
    fn row_lock_statement(&self) -> String;
}

/// Default provider using `SELECT ... FOR UPDATE`
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresLockStatementProvider;

impl LockStatementProvider for PostgresLockStatementProvider {
    fn row_lock_statement(&self) -> String {
        "SELECT outbox_id, last_sequence_number, delivered, version, lock_token \
         FROM outbox_states WHERE outbox_id = $1 FOR UPDATE"
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_statements() {
        assert_eq!(
            IsolationLevel::ReadCommitted.set_statement(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(
            IsolationLevel::Serializable.set_statement(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        );
    }

    #[test]
    fn test_default_lock_statement_takes_row_lock() {
        let statement = PostgresLockStatementProvider.row_lock_statement();
        assert!(statement.contains("FOR UPDATE"));
        assert!(statement.contains("outbox_id = $1"));
    }
}
