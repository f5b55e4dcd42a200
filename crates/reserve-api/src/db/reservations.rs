use super::{is_unique_violation, storage_error};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reserve_core::{
    PaymentResolution, Reservation, ReservationStore, ReserveError, ReserveResult, Transition,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

const COLUMNS: &str = "id, offering_id, requester_id, payer_phone, scheduled_date, \
    scheduled_time, party_size, amount, special_requests, booking_key, payment_key, \
    payment_attempt, correlation_id, receipt_id, payment_status, status, status_reason, \
    inventory_released, created_at_ms, updated_at_ms";

/// Settleable: still pending and no terminal payment outcome
const SETTLEABLE: &str =
    "status = 'pending' AND payment_status NOT IN ('completed', 'failed')";

/// Reservation rows; transitions are conditional updates on the row itself
pub struct SqliteReservationStore {
    pool: SqlitePool,
}

impl SqliteReservationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: &str,
    ) -> ReserveResult<Option<Reservation>> {
        let sql = format!("SELECT {} FROM reservations WHERE {} = ?;", COLUMNS, clause);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn exists(&self, id: Uuid) -> ReserveResult<bool> {
        let row = sqlx::query("SELECT 1 FROM reservations WHERE id = ?;")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(row.is_some())
    }

    /// `Ok(false)` for an existing row the update did not match
    async fn applied(&self, id: Uuid, rows_affected: u64) -> ReserveResult<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(not_found(id))
        }
    }
}

#[async_trait]
impl ReservationStore for SqliteReservationStore {
    async fn insert(&self, r: &Reservation) -> ReserveResult<()> {
        let sql = format!(
            "INSERT INTO reservations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
            COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(r.id.to_string())
            .bind(&r.offering_id)
            .bind(&r.requester_id)
            .bind(&r.payer_phone)
            .bind(r.scheduled_date.format("%Y-%m-%d").to_string())
            .bind(&r.scheduled_time)
            .bind(r.party_size as i64)
            .bind(to_i64(r.amount)?)
            .bind(&r.special_requests)
            .bind(&r.booking_key)
            .bind(&r.payment_key)
            .bind(r.payment_attempt as i64)
            .bind(&r.correlation_id)
            .bind(&r.receipt_id)
            .bind(r.payment_status.as_str())
            .bind(r.status.as_str())
            .bind(&r.status_reason)
            .bind(r.inventory_released)
            .bind(r.created_at.timestamp_millis())
            .bind(r.updated_at.timestamp_millis())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let Some(key) = &r.booking_key else {
                    return Err(storage_error(e));
                };
                match self.find_by_booking_key(key).await? {
                    Some(existing) => Err(ReserveError::DuplicateBooking {
                        key: key.clone(),
                        reservation_id: existing.id.to_string(),
                    }),
                    None => Err(storage_error(e)),
                }
            }
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn get(&self, id: Uuid) -> ReserveResult<Option<Reservation>> {
        self.fetch_one_where("id", &id.to_string()).await
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> ReserveResult<Option<Reservation>> {
        self.fetch_one_where("correlation_id", correlation_id).await
    }

    async fn find_by_booking_key(&self, key: &str) -> ReserveResult<Option<Reservation>> {
        self.fetch_one_where("booking_key", key).await
    }

    async fn record_initiated(
        &self,
        id: Uuid,
        correlation_id: &str,
        at: DateTime<Utc>,
    ) -> ReserveResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE reservations
SET correlation_id = ?, payment_status = 'processing', updated_at_ms = ?
WHERE id = ? AND status = 'pending'
  AND payment_status IN ('pending', 'processing')
  AND correlation_id IS NULL;
"#,
        )
        .bind(correlation_id)
        .bind(at.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ReserveError::Storage(format!(
                    "correlation id {} already belongs to another reservation",
                    correlation_id
                ))
            } else {
                storage_error(e)
            }
        })?;

        self.applied(id, result.rows_affected()).await
    }

    async fn mark_unresolved(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> ReserveResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE reservations
SET payment_status = 'processing', status_reason = ?, updated_at_ms = ?
WHERE id = ? AND status = 'pending' AND payment_status = 'pending';
"#,
        )
        .bind(reason)
        .bind(at.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn settle(
        &self,
        id: Uuid,
        resolution: &PaymentResolution,
        at: DateTime<Utc>,
    ) -> ReserveResult<Transition> {
        let (sql, first): (String, Option<String>) = match resolution {
            PaymentResolution::Succeeded { receipt_id } => (
                format!(
                    "UPDATE reservations \
                     SET payment_status = CASE WHEN payment_status = 'not_required' \
                         THEN 'not_required' ELSE 'completed' END, \
                         status = 'confirmed', \
                         receipt_id = COALESCE(?, receipt_id), \
                         updated_at_ms = ? \
                     WHERE id = ? AND {} RETURNING {};",
                    SETTLEABLE, COLUMNS
                ),
                receipt_id.clone(),
            ),
            PaymentResolution::Failed { reason } => (
                format!(
                    "UPDATE reservations \
                     SET payment_status = 'failed', status = 'cancelled', \
                         status_reason = ?, updated_at_ms = ? \
                     WHERE id = ? AND {} RETURNING {};",
                    SETTLEABLE, COLUMNS
                ),
                Some(reason.clone()),
            ),
        };

        let row = sqlx::query(&sql)
            .bind(first)
            .bind(at.timestamp_millis())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        if let Some(row) = row {
            return Ok(Transition::Applied(row_to_reservation(&row)?));
        }

        match self.get(id).await? {
            Some(current) => Ok(Transition::AlreadySettled(current)),
            None => Err(not_found(id)),
        }
    }

    async fn mark_inventory_released(&self, id: Uuid) -> ReserveResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE reservations
SET inventory_released = 1
WHERE id = ? AND status = 'cancelled' AND inventory_released = 0;
"#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn unmark_inventory_released(&self, id: Uuid) -> ReserveResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE reservations
SET inventory_released = 0
WHERE id = ? AND status = 'cancelled' AND inventory_released = 1;
"#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        self.applied(id, result.rows_affected()).await
    }

    async fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> ReserveResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations \
             WHERE status = 'pending' AND payment_status IN ('pending', 'processing') \
               AND updated_at_ms < ? \
             ORDER BY updated_at_ms \
             LIMIT ?;",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff.timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(row_to_reservation).collect()
    }

    async fn list_unreleased(&self, limit: usize) -> ReserveResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations \
             WHERE status = 'cancelled' AND inventory_released = 0 \
             ORDER BY updated_at_ms \
             LIMIT ?;",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(row_to_reservation).collect()
    }
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_reservation(r: &SqliteRow) -> ReserveResult<Reservation> {
    let id: String = r.try_get("id").map_err(storage_error)?;
    let scheduled_date: String = r.try_get("scheduled_date").map_err(storage_error)?;
    let payment_status: String = r.try_get("payment_status").map_err(storage_error)?;
    let status: String = r.try_get("status").map_err(storage_error)?;

    Ok(Reservation {
        id: Uuid::parse_str(&id)
            .map_err(|e| ReserveError::Storage(format!("invalid reservation id {}: {}", id, e)))?,
        offering_id: r.try_get("offering_id").map_err(storage_error)?,
        requester_id: r.try_get("requester_id").map_err(storage_error)?,
        payer_phone: r.try_get("payer_phone").map_err(storage_error)?,
        scheduled_date: NaiveDate::parse_from_str(&scheduled_date, "%Y-%m-%d").map_err(|e| {
            ReserveError::Storage(format!("invalid scheduled_date {}: {}", scheduled_date, e))
        })?,
        scheduled_time: r.try_get("scheduled_time").map_err(storage_error)?,
        party_size: to_u32(r.try_get("party_size").map_err(storage_error)?)?,
        amount: u64::try_from(r.try_get::<i64, _>("amount").map_err(storage_error)?)
            .map_err(|_| ReserveError::Storage("negative amount".into()))?,
        special_requests: r.try_get("special_requests").map_err(storage_error)?,
        booking_key: r.try_get("booking_key").map_err(storage_error)?,
        payment_key: r.try_get("payment_key").map_err(storage_error)?,
        payment_attempt: to_u32(r.try_get("payment_attempt").map_err(storage_error)?)?,
        correlation_id: r.try_get("correlation_id").map_err(storage_error)?,
        receipt_id: r.try_get("receipt_id").map_err(storage_error)?,
        payment_status: payment_status.parse()?,
        status: status.parse()?,
        status_reason: r.try_get("status_reason").map_err(storage_error)?,
        inventory_released: r.try_get("inventory_released").map_err(storage_error)?,
        created_at: from_millis(r.try_get("created_at_ms").map_err(storage_error)?)?,
        updated_at: from_millis(r.try_get("updated_at_ms").map_err(storage_error)?)?,
    })
}

fn not_found(id: Uuid) -> ReserveError {
    ReserveError::ReservationNotFound {
        reservation_id: id.to_string(),
    }
}

fn to_i64(v: u64) -> ReserveResult<i64> {
    i64::try_from(v).map_err(|_| ReserveError::InvalidRequest(format!("value out of range: {}", v)))
}

fn to_u32(v: i64) -> ReserveResult<u32> {
    u32::try_from(v).map_err(|_| ReserveError::Storage(format!("value out of range: {}", v)))
}

fn from_millis(ms: i64) -> ReserveResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ReserveError::Storage(format!("invalid timestamp: {}", ms)))
}
