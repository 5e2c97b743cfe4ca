//! Schema migrator for the log backend
//!
//! Idempotently creates the outbox tables, the publication and the logical
//! replication slot on first `start`. Safe under concurrent starts by
//! different processes: "already exists" is a non-error everywhere; only
//! "slot already acquired" surfaces, as `ConsumerAlreadyTaken`, and that is
//! detected at stream start rather than here.

use crate::common::{HermesError, Result};
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::{debug, info};

/// Publication covering the primary outbox table.
pub const PUBLICATION: &str = "hermes_outbox_pub";

/// Primary outbox table name.
pub const OUTBOX_TABLE: &str = "hermes_outbox";

/// Secondary (polling) outbox table name.
pub const AUX_TABLE: &str = "hermes_outbox_aux";

/// Consumer-state table name.
pub const STATE_TABLE: &str = "hermes_consumer_state";

/// PostgreSQL identifier limit (NAMEDATALEN - 1).
const PG_MAX_IDENTIFIER_LEN: usize = 63;

/// Replace every byte outside `[A-Za-z0-9_]` with `_`.
fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Deterministic slot name for a (consumer-name, partition-key) pair:
/// `hermes_<consumer>_<partition>`, normalized and capped at 63 bytes.
pub fn slot_name(consumer_name: &str, partition_key: &str) -> String {
    let mut name = format!(
        "hermes_{}_{}",
        normalize_identifier(consumer_name),
        normalize_identifier(partition_key)
    );
    name.truncate(PG_MAX_IDENTIFIER_LEN);
    name
}

/// Create the outbox tables and indexes.
pub async fn migrate(client: &Client, auxiliary: bool) -> Result<()> {
    info!("running outbox migrations");

    client
        .batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {OUTBOX_TABLE} (
                position      BIGSERIAL PRIMARY KEY,
                message_id    TEXT NOT NULL,
                message_type  TEXT NOT NULL,
                partition_key TEXT NOT NULL DEFAULT 'default',
                data          JSONB NOT NULL,
                sent_at       TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS {OUTBOX_TABLE}_partition_position_idx
                ON {OUTBOX_TABLE} (partition_key, position);
            CREATE TABLE IF NOT EXISTS {STATE_TABLE} (
                consumer_name        TEXT NOT NULL,
                partition_key        TEXT NOT NULL,
                last_acked_position  TEXT,
                redelivery_count     INTEGER NOT NULL DEFAULT 0,
                created_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (consumer_name, partition_key)
            );"
        ))
        .await?;

    if auxiliary {
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {AUX_TABLE} (
                    position      BIGSERIAL PRIMARY KEY,
                    consumer_name TEXT NOT NULL,
                    message_id    TEXT NOT NULL,
                    message_type  TEXT NOT NULL,
                    data          JSONB NOT NULL,
                    delivered     BOOLEAN NOT NULL DEFAULT FALSE,
                    fails_count   INTEGER NOT NULL DEFAULT 0,
                    added_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                    sent_at       TIMESTAMPTZ
                );
                CREATE INDEX IF NOT EXISTS {AUX_TABLE}_pending_idx
                    ON {AUX_TABLE} (consumer_name, delivered, added_at);"
            ))
            .await?;
    }

    ensure_publication(client).await?;
    Ok(())
}

/// Create the publication covering the primary outbox; duplicates are fine.
async fn ensure_publication(client: &Client) -> Result<()> {
    let ddl =
        format!("CREATE PUBLICATION {PUBLICATION} FOR TABLE {OUTBOX_TABLE} WITH (publish = 'insert')");
    match client.batch_execute(&ddl).await {
        Ok(()) => {
            info!("created publication {PUBLICATION}");
            Ok(())
        }
        Err(e) if is_duplicate(&e) => {
            debug!("publication {PUBLICATION} already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Create the logical replication slot via SQL; duplicates are fine.
pub async fn ensure_slot(client: &Client, slot: &str) -> Result<()> {
    let create = client
        .query(
            "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
            &[&slot],
        )
        .await;
    match create {
        Ok(_) => {
            info!("created replication slot {slot}");
            Ok(())
        }
        Err(e) if is_duplicate(&e) => {
            debug!("replication slot {slot} already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Check whether the slot is currently held by a live walsender.
pub async fn slot_active_pid(client: &Client, slot: &str) -> Result<Option<i32>> {
    let row = client
        .query_opt(
            "SELECT active_pid FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?;
    Ok(row.and_then(|r| r.get::<_, Option<i32>>(0)))
}

/// Fail with `ConsumerAlreadyTaken` when the slot is held elsewhere.
pub async fn require_slot_free(client: &Client, slot: &str) -> Result<()> {
    match slot_active_pid(client, slot).await? {
        Some(pid) => Err(HermesError::already_taken(format!(
            "{slot} (held by backend {pid})"
        ))),
        None => Ok(()),
    }
}

/// Best-effort termination of backends still holding the slot. The
/// walsender may already be gone; failures are swallowed.
pub async fn terminate_slot_backends(client: &Client, slot: &str) {
    let result = client
        .execute(
            "SELECT pg_terminate_backend(active_pid)
             FROM pg_replication_slots
             WHERE slot_name = $1 AND active_pid IS NOT NULL",
            &[&slot],
        )
        .await;
    if let Err(e) = result {
        debug!("terminating slot backends for {slot} failed: {e}");
    }
}

fn is_duplicate(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(&SqlState::DUPLICATE_OBJECT) | Some(&SqlState::UNIQUE_VIOLATION)
    )
}
