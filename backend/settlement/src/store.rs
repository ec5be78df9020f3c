//! Local persistence: migrations, session token, cached fundraiser list and
//! last good snapshot per fundraiser.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::Result;
use crate::money::Amount;
use crate::types::{Aggregate, Fundraiser, Snapshot};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `:memory:` gets its own empty database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Session token
// ─────────────────────────────────────────────────────────

pub async fn load_token(pool: &SqlitePool) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT token FROM session WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(t,)| t))
}

pub async fn save_token(pool: &SqlitePool, token: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO session (id, token, updated_at) VALUES (1, ?1, strftime('%s', 'now'))
        ON CONFLICT(id) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at
        "#,
    )
    .bind(token)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_token(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM session WHERE id = 1")
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Fundraiser list
// ─────────────────────────────────────────────────────────

/// Replace the cached fundraiser list, keeping display order.
pub async fn save_fundraisers(pool: &SqlitePool, fundraisers: &[Fundraiser]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM fundraisers")
        .execute(&mut *tx)
        .await?;
    for (position, f) in fundraisers.iter().enumerate() {
        sqlx::query("INSERT OR REPLACE INTO fundraisers (id, position, payload) VALUES (?1, ?2, ?3)")
            .bind(&f.id)
            .bind(position as i64)
            .bind(serde_json::to_string(f)?)
            .execute(&mut *tx)
            .await?;
    }
    // Snapshots of fundraisers that are gone (deleted by the owner) go too.
    sqlx::query("DELETE FROM snapshots WHERE fundraiser_id NOT IN (SELECT id FROM fundraisers)")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn load_fundraisers(pool: &SqlitePool) -> Result<Vec<Fundraiser>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT payload FROM fundraisers ORDER BY position ASC")
            .fetch_all(pool)
            .await?;
    rows.into_iter()
        .map(|(payload,)| serde_json::from_str(&payload).map_err(Into::into))
        .collect()
}

// ─────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────

pub async fn save_snapshot(pool: &SqlitePool, fundraiser_id: &str, snapshot: &Snapshot) -> Result<()> {
    let a = &snapshot.aggregate;
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO snapshots
            (fundraiser_id, collected_minor, participants, finally_verified_count, computed_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(fundraiser_id)
    .bind(a.collected.minor())
    .bind(a.participants as i64)
    .bind(a.finally_verified_count as i64)
    .bind(snapshot.computed_at.timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_snapshots(pool: &SqlitePool) -> Result<HashMap<String, Snapshot>> {
    let rows: Vec<(String, i64, i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT fundraiser_id, collected_minor, participants, finally_verified_count, computed_at
        FROM   snapshots
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, collected, participants, verified, computed_at)| {
            let computed_at = Utc.timestamp_opt(computed_at, 0).single()?;
            let snapshot = Snapshot {
                aggregate: Aggregate {
                    collected: Amount::from_minor(collected),
                    participants: participants.max(0) as u64,
                    finally_verified_count: verified.max(0) as u64,
                },
                computed_at,
            };
            Some((id, snapshot))
        })
        .collect())
}
