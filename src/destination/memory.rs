// ABOUTME: In-memory destination for tests and embedding
// ABOUTME: Applies overwrite, append and upsert to stored tables, with write-failure injection

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{Destination, WriteMode};
use crate::record::{key_string, Record};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Vec<Record>>,
    failing_writes: usize,
    writes: usize,
}

/// Destination holding tables in memory.
///
/// Writes are applied to a copy of the table that replaces the original only
/// when the whole batch succeeded, so an injected failure leaves the table
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of a table, or `None` if it was never written.
    pub async fn table(&self, table: &str) -> Option<Vec<Record>> {
        self.inner.lock().await.tables.get(table).cloned()
    }

    /// Seed a table with existing rows.
    pub async fn put_table(&self, table: &str, rows: Vec<Record>) {
        self.inner
            .lock()
            .await
            .tables
            .insert(table.to_string(), rows);
    }

    /// Fail the next `count` writes after half of the batch was applied.
    pub async fn fail_next_writes(&self, count: usize) {
        self.inner.lock().await.failing_writes = count;
    }

    /// Number of successful writes so far.
    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.writes
    }
}

fn upsert(rows: &mut Vec<Record>, record: Record, key: &str) -> Result<()> {
    let Some(id) = record.get(key).and_then(key_string) else {
        bail!("record has no value for key '{}'", key);
    };
    match rows
        .iter_mut()
        .find(|row| row.get(key).and_then(key_string).as_deref() == Some(id.as_str()))
    {
        Some(existing) => *existing = record,
        None => rows.push(record),
    }
    Ok(())
}

impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, table: &str, records: Vec<Record>, mode: WriteMode) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let written = records.len() as u64;

        let mut staged = match mode {
            WriteMode::Overwrite => Vec::with_capacity(records.len()),
            _ => inner.tables.get(table).cloned().unwrap_or_default(),
        };

        let fail_at = if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            Some(records.len() / 2)
        } else {
            None
        };

        for (idx, record) in records.into_iter().enumerate() {
            if fail_at == Some(idx) {
                bail!(
                    "injected write failure on table '{}' after {} record(s)",
                    table,
                    idx
                );
            }
            match &mode {
                WriteMode::Overwrite | WriteMode::Append => staged.push(record),
                WriteMode::Upsert { key } => upsert(&mut staged, record, key)?,
            }
        }
        if fail_at.is_some() {
            bail!("injected write failure on table '{}'", table);
        }

        info!("memory destination: {} row(s) to '{}' ({:?})", written, table, mode);
        inner.tables.insert(table.to_string(), staged);
        inner.writes += 1;
        Ok(written)
    }

    async fn read_table(&self, table: &str) -> Result<Vec<Record>> {
        Ok(self.table(table).await.unwrap_or_default())
    }
}
