//! Storage directory, schema versioning and destructive migration.
//!
//! The storage directory holds the LanceDB tables plus a small
//! `.db-version` marker file. Vectors are tied to one model and one
//! dimension, so any version or dimension drift clears the vector table and
//! marks every file `Outdated`; files are then re-indexed from source.

use arrow_schema::DataType;
use semadex_core::FileStatus;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::schema::{file_status_schema, vectors_schema};

/// Bump whenever the stored layout or the embedding model changes in a way
/// that invalidates existing vectors.
pub const SCHEMA_VERSION: u32 = 1;

const VERSION_FILE: &str = ".db-version";
const VECTORS_TABLE: &str = "vectors";
const FILE_STATUS_TABLE: &str = "file_status";

#[derive(Error, Debug)]
pub enum DbError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Not found: {0}")]
  NotFound(String),
  #[error("Invalid row: {0}")]
  InvalidRow(String),
  #[error("Schema mismatch: stored version {stored} is newer than code version {code}")]
  SchemaMismatch { stored: u32, code: u32 },
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Handle to the vector store and the file status store.
///
/// Mutations go through a single writer lane; reads rely on the engine's
/// snapshot semantics and are never blocked by writers.
pub struct SearchDb {
  pub path: PathBuf,
  pub connection: lancedb::Connection,
  pub vector_dim: usize,
  /// True when this open performed a destructive migration
  pub migrated: bool,
  pub(crate) write_lane: Mutex<()>,
  pub(crate) status_cache: RwLock<HashMap<String, FileStatus>>,
}

impl SearchDb {
  /// Open or create the store at `dir`, running the destructive migration
  /// if the stored schema version or vector dimension differs.
  pub async fn open(dir: &Path, vector_dim: usize) -> Result<Self> {
    std::fs::create_dir_all(dir)?;

    let stored_version = read_version(dir)?;
    info!(path = %dir.display(), ?stored_version, code_version = SCHEMA_VERSION, "Opening vector store");

    let connection = lancedb::connect(dir.to_string_lossy().as_ref()).execute().await?;

    let mut db = Self {
      path: dir.to_path_buf(),
      connection,
      vector_dim,
      migrated: false,
      write_lane: Mutex::new(()),
      status_cache: RwLock::new(HashMap::new()),
    };

    match stored_version {
      None => {
        // Fresh store
        db.ensure_tables().await?;
        write_version(dir, SCHEMA_VERSION)?;
      }
      Some(stored) if stored > SCHEMA_VERSION => {
        return Err(DbError::SchemaMismatch {
          stored,
          code: SCHEMA_VERSION,
        });
      }
      Some(stored) if stored < SCHEMA_VERSION => {
        warn!(stored, code = SCHEMA_VERSION, "Schema version behind, running destructive migration");
        db.ensure_tables().await?;
        db.migrate().await?;
      }
      Some(_) => {
        db.ensure_tables().await?;
        // Same version, but a dimension change also invalidates vectors
        if let Some(existing_dim) = db.stored_vector_dim().await?
          && existing_dim != vector_dim
        {
          warn!(existing_dim, configured = vector_dim, "Vector dimension changed, running destructive migration");
          db.migrate().await?;
        }
      }
    }

    Ok(db)
  }

  async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;

    if !table_names.contains(&VECTORS_TABLE.to_string()) {
      debug!("Creating vectors table");
      self
        .connection
        .create_empty_table(VECTORS_TABLE, vectors_schema(self.vector_dim))
        .execute()
        .await?;
    }

    if !table_names.contains(&FILE_STATUS_TABLE.to_string()) {
      debug!("Creating file_status table");
      self
        .connection
        .create_empty_table(FILE_STATUS_TABLE, file_status_schema())
        .execute()
        .await?;
    }

    Ok(())
  }

  /// Destructive migration: drop every vector row, mark every file status
  /// `Outdated`, write the current version marker.
  async fn migrate(&mut self) -> Result<()> {
    let _guard = self.write_lane.lock().await;

    self.connection.drop_table(VECTORS_TABLE, &[]).await?;
    self
      .connection
      .create_empty_table(VECTORS_TABLE, vectors_schema(self.vector_dim))
      .execute()
      .await?;

    drop(_guard);
    let outdated = self.mark_all_outdated().await?;
    write_version(&self.path, SCHEMA_VERSION)?;
    self.migrated = true;

    info!(outdated, "Destructive migration complete, store cleared");
    Ok(())
  }

  /// Vector dimension of the existing vectors table, if any.
  async fn stored_vector_dim(&self) -> Result<Option<usize>> {
    let table_names = self.connection.table_names().execute().await?;
    if !table_names.contains(&VECTORS_TABLE.to_string()) {
      return Ok(None);
    }

    let table = self.vectors_table().await?;
    let schema = table.schema().await?;
    let Ok(field) = schema.field_with_name("vector") else {
      return Ok(None);
    };

    match field.data_type() {
      DataType::FixedSizeList(_, dim) => Ok(Some(*dim as usize)),
      _ => Ok(None),
    }
  }

  pub(crate) async fn vectors_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(VECTORS_TABLE).execute().await?)
  }

  pub(crate) async fn file_status_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(FILE_STATUS_TABLE).execute().await?)
  }
}

fn version_path(dir: &Path) -> PathBuf {
  dir.join(VERSION_FILE)
}

fn read_version(dir: &Path) -> Result<Option<u32>> {
  let path = version_path(dir);
  if !path.exists() {
    return Ok(None);
  }

  let content = std::fs::read_to_string(&path)?;
  match content.trim().parse::<u32>() {
    Ok(version) => Ok(Some(version)),
    Err(_) => {
      warn!(path = %path.display(), "Corrupted schema version marker, treating store as stale");
      Ok(Some(0))
    }
  }
}

fn write_version(dir: &Path, version: u32) -> Result<()> {
  std::fs::write(version_path(dir), version.to_string())?;
  Ok(())
}

/// Escape a string literal for use in a LanceDB SQL filter.
pub(crate) fn escape_literal(value: &str) -> String {
  value.replace('\'', "''")
}
