// ABOUTME: PostgreSQL destination storing records as JSONB rows in one schema per dataset
// ABOUTME: Overwrite swaps in a staging table; append and upsert run in a single transaction

use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient};

use super::{Destination, WriteMode};
use crate::record::{key_string, Record};
use crate::utils::{quote_ident, validate_identifier};

/// Rows per multi-value INSERT (two parameters per row).
const INSERT_CHUNK_ROWS: usize = 1000;

/// Destination writing into PostgreSQL tables of the form
///
/// - `_row_id`: BIGSERIAL PRIMARY KEY (insertion order)
/// - `_key`: TEXT, the merge key (NULL for replace/append rows)
/// - `data`: JSONB NOT NULL, the whole normalized record
/// - `_loaded_at`: TIMESTAMPTZ NOT NULL DEFAULT NOW()
///
/// Records are stored whole, so new source fields never require DDL.
pub struct PgDestination {
    client: Mutex<Client>,
    schema: String,
}

impl PgDestination {
    /// Connect to `url` and make sure the dataset schema exists.
    pub async fn connect(url: &str, dataset: &str) -> Result<Self> {
        let client = crate::postgres::connect_with_retry(url)
            .await
            .context("Failed to connect to destination database")?;
        Self::new(client, dataset).await
    }

    pub async fn new(client: Client, dataset: &str) -> Result<Self> {
        validate_identifier(dataset).context("Invalid dataset name")?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(dataset)
            ))
            .await
            .with_context(|| format!("Failed to create schema '{}'", dataset))?;

        Ok(Self {
            client: Mutex::new(client),
            schema: dataset.to_string(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

fn create_table_sql(qualified: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
            _row_id BIGSERIAL PRIMARY KEY,
            _key TEXT,
            data JSONB NOT NULL,
            _loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#,
        qualified
    )
}

fn key_index_sql(schema: &str, table: &str) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}.{} (_key)",
        quote_ident(&format!("{}__key", table)),
        quote_ident(schema),
        quote_ident(table)
    )
}

/// Split records into `(_key, data)` rows.
fn to_rows(records: Vec<Record>, key: Option<&str>) -> Result<Vec<(Option<String>, JsonValue)>> {
    records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| {
            let row_key = match key {
                Some(field) => match record.get(field).and_then(key_string) {
                    Some(k) => Some(k),
                    None => bail!("record {} has no value for key '{}'", idx, field),
                },
                None => None,
            };
            Ok((row_key, JsonValue::Object(record)))
        })
        .collect()
}

/// Insert rows in chunks of multi-value INSERTs.
async fn insert_rows<C: GenericClient>(
    client: &C,
    qualified: &str,
    rows: &[(Option<String>, JsonValue)],
    upsert: bool,
) -> Result<u64> {
    let mut total = 0u64;
    for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
        let mut placeholders = Vec::with_capacity(chunk.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 2);
        for (idx, (key, data)) in chunk.iter().enumerate() {
            let base = idx * 2 + 1;
            placeholders.push(format!("(${}, ${})", base, base + 1));
            params.push(key);
            params.push(data);
        }

        let mut sql = format!(
            "INSERT INTO {} (_key, data) VALUES {}",
            qualified,
            placeholders.join(", ")
        );
        if upsert {
            sql.push_str(
                " ON CONFLICT (_key) DO UPDATE SET data = EXCLUDED.data, _loaded_at = NOW()",
            );
        }

        total += client
            .execute(sql.as_str(), &params)
            .await
            .with_context(|| format!("Failed to insert batch into {}", qualified))?;
    }
    Ok(total)
}

impl Destination for PgDestination {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn write(&self, table: &str, records: Vec<Record>, mode: WriteMode) -> Result<u64> {
        validate_identifier(table).context("Invalid destination table name")?;
        let target = self.qualified(table);

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to open destination transaction")?;

        let written = match &mode {
            WriteMode::Overwrite => {
                let staging_name = format!("{}__staging", table);
                let staging = self.qualified(&staging_name);
                let rows = to_rows(records, None)?;

                tx.batch_execute(&format!(
                    "DROP TABLE IF EXISTS {staging}; {create}",
                    staging = staging,
                    create = create_table_sql(&staging)
                ))
                .await
                .with_context(|| format!("Failed to prepare staging table {}", staging))?;

                let written = insert_rows(&tx, &staging, &rows, false).await?;

                tx.batch_execute(&format!(
                    "DROP TABLE IF EXISTS {target}; ALTER TABLE {staging} RENAME TO {name}",
                    target = target,
                    staging = staging,
                    name = quote_ident(table)
                ))
                .await
                .with_context(|| format!("Failed to swap staging table into {}", target))?;
                written
            }
            WriteMode::Append => {
                let rows = to_rows(records, None)?;
                tx.batch_execute(&create_table_sql(&target))
                    .await
                    .with_context(|| format!("Failed to create table {}", target))?;
                insert_rows(&tx, &target, &rows, false).await?
            }
            WriteMode::Upsert { key } => {
                let rows = to_rows(records, Some(key))?;
                tx.batch_execute(&format!(
                    "{}; {}",
                    create_table_sql(&target),
                    key_index_sql(&self.schema, table)
                ))
                .await
                .with_context(|| format!("Failed to prepare table {} for upsert", target))?;
                insert_rows(&tx, &target, &rows, true).await?
            }
        };

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit write to {}", target))?;

        tracing::info!("Wrote {} row(s) to {} ({:?})", written, target, mode);
        Ok(written)
    }

    async fn read_table(&self, table: &str) -> Result<Vec<Record>> {
        validate_identifier(table).context("Invalid destination table name")?;
        let client = self.client.lock().await;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&self.schema.as_str(), &table],
            )
            .await
            .context("Failed to check table existence")?
            .get(0);
        if !exists {
            return Ok(Vec::new());
        }

        let rows = client
            .query(
                &format!("SELECT data FROM {} ORDER BY _row_id", self.qualified(table)),
                &[],
            )
            .await
            .with_context(|| format!("Failed to read table {}", self.qualified(table)))?;

        rows.into_iter()
            .map(|row| match row.get::<_, JsonValue>(0) {
                JsonValue::Object(record) => Ok(record),
                other => bail!("row in {} is not a JSON object: {}", table, other),
            })
            .collect()
    }
}
