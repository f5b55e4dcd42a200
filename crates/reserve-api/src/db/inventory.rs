use super::{is_unique_violation, storage_error};
use async_trait::async_trait;
use reserve_core::{InventoryEntry, InventoryLedger, Offering, ReserveError, ReserveResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Inventory rows guarded by `CHECK (remaining BETWEEN 0 AND total)`
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn require(&self, offering_id: &str) -> ReserveResult<InventoryEntry> {
        self.get(offering_id)
            .await?
            .ok_or_else(|| ReserveError::OfferingNotFound {
                offering_id: offering_id.to_string(),
            })
    }
}

#[async_trait]
impl InventoryLedger for SqliteLedger {
    async fn publish(&self, offering: &Offering) -> ReserveResult<InventoryEntry> {
        let total = offering.total_capacity();

        let result = sqlx::query(
            r#"
INSERT INTO inventory (offering_id, name, kind, total, remaining)
VALUES (?, ?, ?, ?, ?);
"#,
        )
        .bind(&offering.id)
        .bind(&offering.name)
        .bind(offering.kind.as_str())
        .bind(total as i64)
        .bind(total as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InventoryEntry {
                offering_id: offering.id.clone(),
                total,
                remaining: total,
            }),
            Err(e) if is_unique_violation(&e) => Err(ReserveError::OfferingExists {
                offering_id: offering.id.clone(),
            }),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn try_decrement(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry> {
        if amount == 0 {
            return Err(ReserveError::InvalidRequest(
                "decrement amount must be positive".into(),
            ));
        }

        let row = sqlx::query(
            r#"
UPDATE inventory
SET remaining = remaining - ?
WHERE offering_id = ? AND remaining >= ?
RETURNING offering_id, total, remaining;
"#,
        )
        .bind(amount as i64)
        .bind(offering_id)
        .bind(amount as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(r) => {
                let entry = row_to_entry(&r)?;
                debug!(
                    "Decremented {} by {}: remaining={}",
                    offering_id, amount, entry.remaining
                );
                Ok(entry)
            }
            None => {
                let current = self.require(offering_id).await?;
                Err(ReserveError::InsufficientCapacity {
                    offering_id: offering_id.to_string(),
                    requested: amount,
                    remaining: current.remaining,
                })
            }
        }
    }

    async fn restore(&self, offering_id: &str, amount: u32) -> ReserveResult<InventoryEntry> {
        let row = sqlx::query(
            r#"
UPDATE inventory
SET remaining = MIN(total, remaining + ?)
WHERE offering_id = ?
RETURNING offering_id, total, remaining;
"#,
        )
        .bind(amount as i64)
        .bind(offering_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        let entry = row
            .as_ref()
            .map(row_to_entry)
            .transpose()?
            .ok_or_else(|| ReserveError::OfferingNotFound {
                offering_id: offering_id.to_string(),
            })?;
        debug!(
            "Restored {} by {}: remaining={}",
            offering_id, amount, entry.remaining
        );
        Ok(entry)
    }

    async fn get(&self, offering_id: &str) -> ReserveResult<Option<InventoryEntry>> {
        let row = sqlx::query(
            r#"SELECT offering_id, total, remaining FROM inventory WHERE offering_id = ?;"#,
        )
        .bind(offering_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(row_to_entry).transpose()
    }
}

fn row_to_entry(r: &SqliteRow) -> ReserveResult<InventoryEntry> {
    let total: i64 = r.try_get("total").map_err(storage_error)?;
    let remaining: i64 = r.try_get("remaining").map_err(storage_error)?;

    Ok(InventoryEntry {
        offering_id: r.try_get("offering_id").map_err(storage_error)?,
        total: u32::try_from(total)
            .map_err(|_| ReserveError::Storage(format!("invalid total: {}", total)))?,
        remaining: u32::try_from(remaining)
            .map_err(|_| ReserveError::Storage(format!("invalid remaining: {}", remaining)))?,
    })
}
