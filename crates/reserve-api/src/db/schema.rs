use sqlx::SqlitePool;

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Inventory
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS inventory (
  offering_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  total INTEGER NOT NULL CHECK (total >= 0),
  remaining INTEGER NOT NULL,
  CHECK (remaining BETWEEN 0 AND total)
);
"#,
    )
    .execute(pool)
    .await?;

    // Reservations
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS reservations (
  id TEXT PRIMARY KEY,
  offering_id TEXT NOT NULL,
  requester_id TEXT NOT NULL,
  payer_phone TEXT,
  scheduled_date TEXT NOT NULL,
  scheduled_time TEXT NOT NULL,
  party_size INTEGER NOT NULL CHECK (party_size > 0),
  amount INTEGER NOT NULL CHECK (amount >= 0),
  special_requests TEXT,
  booking_key TEXT,
  payment_key TEXT NOT NULL,
  payment_attempt INTEGER NOT NULL,
  correlation_id TEXT,
  receipt_id TEXT,
  payment_status TEXT NOT NULL,
  status TEXT NOT NULL,
  status_reason TEXT,
  inventory_released INTEGER NOT NULL DEFAULT 0 CHECK (inventory_released IN (0,1)),
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_correlation ON reservations(correlation_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_booking_key ON reservations(booking_key);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_reservations_sweep ON reservations(status, payment_status, updated_at_ms);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
