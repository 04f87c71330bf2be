//! Transaction management utilities for the Postgres ledger store.

use sqlx::postgres::PgTransaction;
use sqlx::PgPool;

use crate::error::StoreError;

/// Begin a new database transaction.
///
/// Dropping the handle without committing rolls everything back, which is how
/// the store unwinds a lost compare-and-swap.
pub async fn begin_transaction(db: &PgPool) -> Result<PgTransaction<'static>, StoreError> {
    db.begin().await.map_err(StoreError::from)
}

pub async fn commit_transaction(tx: PgTransaction<'_>) -> Result<(), StoreError> {
    tx.commit().await.map_err(StoreError::from)
}

/// Rollback a transaction explicitly, e.g. after a lost compare-and-swap.
pub async fn rollback_transaction(tx: PgTransaction<'_>) -> Result<(), StoreError> {
    tx.rollback().await.map_err(StoreError::from)
}
