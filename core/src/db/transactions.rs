//! ACID transaction helpers

use super::Result;
use rusqlite::Connection;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;

/// Execute operation within ACID transaction
///
/// Commits when `operation` returns `Ok`. On `Err` the transaction is
/// dropped, which rolls it back.
///
/// Writers should pass [`TransactionBehavior::Immediate`] so the write
/// lock is taken up front and the busy timeout applies, instead of failing
/// on lock upgrade half way through a read-modify-write.
pub fn execute_in_transaction<F, T>(
    conn: &mut Connection,
    behavior: TransactionBehavior,
    operation: F,
) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(behavior)?;
    let result = operation(&tx)?;
    tx.commit()?;
    Ok(result)
}
