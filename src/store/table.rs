//! Table Store
//!
//! One SQLite database per run, file-backed or in memory. Steps exchange
//! data by table name only: a producer writes its table, a consumer looks
//! it up by the producer's step id. Every table records the step that
//! created it and only that step may write to it again.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use super::batch::BatchSource;
use super::value::{Batch, Column, ColumnType, Schema, Value};
use super::StoreError;
use crate::error::StepError;
use crate::manifest::is_valid_step_id;

/// Rows per page when exporting.
const EXPORT_BATCH: usize = 1000;

/// Name of a table in the run's store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct TableStore {
    conn: Connection,
    location: StoreLocation,
    owners: RefCell<HashMap<String, String>>,
}

impl TableStore {
    /// Opens a fresh store at `path`. An existing file is refused so two
    /// runs never share a store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::StoreExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!("Opened table store at {}", path.display());
        Self::configure(conn, StoreLocation::File(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, StoreLocation::Memory)
    }

    fn configure(conn: Connection, location: StoreLocation) -> Result<Self, StoreError> {
        // The store lives only as long as the run; durability is not needed
        conn.pragma_update(None, "synchronous", 0)?;
        // 2 = MEMORY
        conn.pragma_update(None, "temp_store", 2)?;
        Ok(Self {
            conn,
            location,
            owners: RefCell::new(HashMap::new()),
        })
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Caps SQLite's auxiliary worker threads. Returns the effective value.
    pub fn set_threads(&self, threads: usize) -> Result<i64, StoreError> {
        let threads = i64::try_from(threads).unwrap_or(i64::MAX);
        Ok(self
            .conn
            .pragma_update_and_check(None, "threads", threads, |row| row.get::<_, i64>(0))?)
    }

    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(found.is_some())
    }

    /// Table names in creation order.
    pub fn tables(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.owners.borrow().get(name).cloned()
    }

    fn check_new_table(&self, name: &str) -> Result<(), StoreError> {
        if !is_valid_step_id(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        if self.exists(name)? {
            return Err(StoreError::AlreadyExists {
                table: name.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_owner(&self, owner: &str, name: &str) -> Result<(), StoreError> {
        if !self.exists(name)? {
            return Err(StoreError::MissingTable {
                table: name.to_string(),
            });
        }
        match self.owners.borrow().get(name) {
            Some(o) if o == owner => Ok(()),
            Some(o) => Err(StoreError::NotOwner {
                table: name.to_string(),
                owner: o.clone(),
                step: owner.to_string(),
            }),
            None => Err(StoreError::NotOwner {
                table: name.to_string(),
                owner: "<external>".to_string(),
                step: owner.to_string(),
            }),
        }
    }

    /// Creates an empty table owned by `owner`.
    pub fn create_table(
        &self,
        owner: &str,
        name: &str,
        schema: &Schema,
    ) -> Result<TableRef, StoreError> {
        self.check_new_table(name)?;
        if schema.is_empty() {
            return Err(StoreError::InvalidQuery(format!(
                "table '{}' needs at least one column",
                name
            )));
        }

        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_name()))
            .collect();
        self.conn.execute(
            &format!("CREATE TABLE {} ({})", quote_ident(name), columns.join(", ")),
            [],
        )?;
        self.owners
            .borrow_mut()
            .insert(name.to_string(), owner.to_string());
        debug!("Created table '{}' for step '{}'", name, owner);
        Ok(TableRef::new(name))
    }

    /// Materializes a read-only query as a new table owned by `owner`.
    pub fn create_table_as(
        &self,
        owner: &str,
        name: &str,
        select_sql: &str,
    ) -> Result<TableRef, StoreError> {
        self.check_new_table(name)?;
        let select_sql = self.check_read_only(select_sql)?;
        self.conn.execute(
            &format!("CREATE TABLE {} AS {}", quote_ident(name), select_sql),
            [],
        )?;
        self.owners
            .borrow_mut()
            .insert(name.to_string(), owner.to_string());
        debug!("Materialized table '{}' for step '{}'", name, owner);
        Ok(TableRef::new(name))
    }

    /// Inserts the rows of a read-only query into an owned table.
    pub fn insert_select(
        &self,
        owner: &str,
        name: &str,
        select_sql: &str,
        params: &[Value],
    ) -> Result<u64, StoreError> {
        self.ensure_owner(owner, name)?;
        let select_sql = self.check_read_only(select_sql)?;
        let inserted = self.conn.execute(
            &format!("INSERT INTO {} {}", quote_ident(name), select_sql),
            params_from_iter(params.iter()),
        )?;
        Ok(inserted as u64)
    }

    fn check_read_only<'q>(&self, select_sql: &'q str) -> Result<&'q str, StoreError> {
        let trimmed = select_sql.trim().trim_end_matches(';').trim_end();
        if trimmed.contains(';') {
            return Err(StoreError::InvalidQuery(trimmed.to_string()));
        }
        let stmt = self.conn.prepare(trimmed)?;
        if !stmt.readonly() || stmt.column_count() == 0 {
            return Err(StoreError::InvalidQuery(trimmed.to_string()));
        }
        Ok(trimmed)
    }

    /// Appends one batch inside a transaction.
    pub fn append(&self, owner: &str, name: &str, batch: &Batch) -> Result<u64, StoreError> {
        self.ensure_owner(owner, name)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let schema = self.schema(name)?;
        if let Some(unknown) = batch.columns.iter().find(|c| !schema.contains(c)) {
            return Err(StoreError::UnknownColumn {
                table: name.to_string(),
                column: unknown.clone(),
            });
        }

        let columns: Vec<String> = batch.columns.iter().map(|c| quote_ident(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns.join(", "),
            placeholders.join(", ")
        );

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in &batch.rows {
                if row.len() != batch.columns.len() {
                    return Err(StoreError::ColumnMismatch {
                        table: name.to_string(),
                        expected: batch.columns.len(),
                        got: row.len(),
                    });
                }
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(batch.len() as u64)
    }

    /// Drains `source` into an owned table one bounded batch at a time.
    ///
    /// `checkpoint` runs before every batch so a deadline can stop the
    /// stream between batches.
    pub fn append_stream(
        &self,
        owner: &str,
        name: &str,
        source: &mut dyn BatchSource,
        batch_size: usize,
        checkpoint: &mut dyn FnMut() -> Result<(), StepError>,
    ) -> Result<u64, StepError> {
        let batch_size = batch_size.max(1);
        let mut total = 0u64;
        loop {
            checkpoint()?;
            match source.next_batch(batch_size)? {
                Some(batch) if !batch.is_empty() => {
                    total += self.append(owner, name, &batch)?;
                }
                _ => break,
            }
        }
        Ok(total)
    }

    pub fn row_count(&self, name: &str) -> Result<u64, StoreError> {
        if !self.exists(name)? {
            return Err(StoreError::MissingTable {
                table: name.to_string(),
            });
        }
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn schema(&self, name: &str) -> Result<Schema, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let columns = stmt
            .query_map([], |row| {
                let column: String = row.get(1)?;
                let declared: String = row.get(2)?;
                Ok(Column::new(column, ColumnType::from_declared(&declared)))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(StoreError::MissingTable {
                table: name.to_string(),
            });
        }
        Ok(Schema::new(columns))
    }

    /// Pages through a table in rowid order.
    pub fn scan(&self, name: &str, batch_size: usize) -> Result<TableScan<'_>, StoreError> {
        let schema = self.schema(name)?;
        let columns: Vec<String> = schema.columns.into_iter().map(|c| c.name).collect();
        let projection: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        Ok(TableScan {
            store: self,
            sql: format!(
                "SELECT rowid, {} FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
                projection.join(", "),
                quote_ident(name)
            ),
            columns,
            last_rowid: i64::MIN,
            batch_size: batch_size.max(1),
            done: false,
        })
    }

    /// Drops every table `owner` created. Used before a retry.
    pub fn drop_owned(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        let owned: Vec<String> = self
            .owners
            .borrow()
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(t, _)| t.clone())
            .collect();

        for table in &owned {
            self.conn
                .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
            self.owners.borrow_mut().remove(table);
            debug!("Dropped table '{}' owned by '{}'", table, owner);
        }
        Ok(owned)
    }

    /// Writes a table as JSON Lines. Returns the number of rows written.
    pub fn export_jsonl(&self, name: &str, path: &Path) -> Result<u64, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        let mut rows = 0u64;
        for batch in self.scan(name, EXPORT_BATCH)? {
            let batch = batch?;
            batch.write_jsonl(&mut out)?;
            rows += batch.len() as u64;
        }
        out.flush()?;
        Ok(rows)
    }

    /// Closes the connection. File-backed stores are deleted unless `keep`.
    pub fn close(self, keep: bool) -> Result<(), StoreError> {
        let location = self.location.clone();
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;

        if let StoreLocation::File(path) = location {
            if !keep && path.exists() {
                fs::remove_file(&path)?;
                let journal = path.with_extension("db-journal");
                if journal.exists() {
                    if let Err(e) = fs::remove_file(&journal) {
                        warn!("Could not remove {}: {}", journal.display(), e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Iterator over a table in bounded batches.
pub struct TableScan<'s> {
    store: &'s TableStore,
    sql: String,
    columns: Vec<String>,
    last_rowid: i64,
    batch_size: usize,
    done: bool,
}

impl TableScan<'_> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn fetch(&mut self) -> Result<Batch, StoreError> {
        let store = self.store;
        let mut stmt = store.conn.prepare_cached(&self.sql)?;
        let limit = i64::try_from(self.batch_size).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![self.last_rowid, limit])?;

        let width = self.columns.len();
        let mut batch = Batch::with_capacity(self.columns.clone(), self.batch_size);
        while let Some(row) = rows.next()? {
            self.last_rowid = row.get(0)?;
            let mut values = Vec::with_capacity(width);
            for i in 1..=width {
                values.push(Value::from_sql_ref(row.get_ref(i)?));
            }
            batch.push_row(values);
        }
        Ok(batch)
    }
}

impl Iterator for TableScan<'_> {
    type Item = Result<Batch, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch() {
            Ok(batch) if batch.is_empty() => {
                self.done = true;
                None
            }
            Ok(batch) => {
                if batch.len() < self.batch_size {
                    self.done = true;
                }
                Some(Ok(batch))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
