use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const CHAINS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("chains");

const META_KEY: &str = "meta";
const APP_DIR: &str = "blocksync";
const BLOBS_DIR: &str = "blobs";

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("db"),
        }
    }
}

#[derive(Debug)]
pub struct ChainStore {
    root_dir: PathBuf,
    db: Database,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unsupported schema version {version}")]
    UnsupportedSchemaVersion { version: u32 },
    #[error("chain {id} not found")]
    ChainNotFound { id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub schema_version: u32,
    pub app_version: String,
    pub created_at: u64,
}

impl Meta {
    fn new() -> Result<Self, StoreError> {
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now_epoch_secs()?,
        })
    }
}

/// Durable per-chain record. `cursor` is the last height fully ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: u64,
    pub key: String,
    pub client_kind: String,
    pub encrypted_endpoint: String,
    pub cursor: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFilter {
    All,
    EnabledOnly,
}

impl ChainStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let root_dir = config.root_dir;
        let app_dir = app_dir(&root_dir);
        std::fs::create_dir_all(&app_dir)?;
        let db_path = db_path(&root_dir);

        loop {
            let db = if db_path.exists() {
                Database::open(&db_path)?
            } else {
                Database::create(&db_path)?
            };

            let store = Self {
                root_dir: root_dir.clone(),
                db,
            };
            store.initialize_schema()?;

            match store.read_meta()? {
                None => {
                    let meta = Meta::new()?;
                    store.write_meta(&meta)?;
                    return Ok(store);
                }
                Some(meta) if meta.schema_version > CURRENT_SCHEMA_VERSION => {
                    drop(store);
                    backup_db(&db_path)?;
                    continue;
                }
                Some(meta) if meta.schema_version < CURRENT_SCHEMA_VERSION => {
                    if let Err(err) =
                        store.run_migrations(meta.schema_version, CURRENT_SCHEMA_VERSION)
                    {
                        if matches!(err, StoreError::UnsupportedSchemaVersion { .. }) {
                            drop(store);
                            backup_db(&db_path)?;
                            continue;
                        }
                        return Err(err);
                    }

                    let meta = Meta {
                        schema_version: CURRENT_SCHEMA_VERSION,
                        app_version: env!("CARGO_PKG_VERSION").to_string(),
                        created_at: meta.created_at,
                    };
                    store.write_meta(&meta)?;
                    return Ok(store);
                }
                Some(_) => return Ok(store),
            }
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn app_dir(&self) -> PathBuf {
        app_dir(&self.root_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        db_path(&self.root_dir)
    }

    pub fn blob_dir(&self) -> PathBuf {
        blobs_dir(&self.root_dir)
    }

    pub fn ensure_blob_dir(&self, kind: &str) -> Result<PathBuf, StoreError> {
        let dir = self.blob_dir().join(kind);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn blob_path(&self, kind: &str, name: &str) -> PathBuf {
        self.blob_dir().join(kind).join(name)
    }

    pub fn get_chain(&self, id: u64) -> Result<Option<ChainRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHAINS_TABLE)?;
        match table.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_chain(&self, record: &ChainRecord) -> Result<(), StoreError> {
        let data = encode(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHAINS_TABLE)?;
            table.insert(record.id, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Chains ordered by id. With `EnabledOnly`, disabled chains are
    /// filtered out before the caller ever sees them.
    pub fn list_chains(&self, filter: ChainFilter) -> Result<Vec<ChainRecord>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHAINS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: ChainRecord = decode(value.value())?;
            if filter == ChainFilter::EnabledOnly && !record.enabled {
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Persist the advanced cursor for one chain. The commit has been
    /// fsynced by the time this returns, so a crash afterwards resumes at
    /// `new_height` exactly.
    pub fn update_height(&self, id: u64, new_height: u64) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHAINS_TABLE)?;
            let mut record: ChainRecord = match table.get(id)? {
                Some(value) => decode(value.value())?,
                None => return Err(StoreError::ChainNotFound { id }),
            };
            record.cursor = new_height;
            let data = encode(&record)?;
            table.insert(id, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn set_enabled(&self, id: u64, enabled: bool) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHAINS_TABLE)?;
            let mut record: ChainRecord = match table.get(id)? {
                Some(value) => decode(value.value())?,
                None => return Err(StoreError::ChainNotFound { id }),
            };
            record.enabled = enabled;
            let data = encode(&record)?;
            table.insert(id, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        txn.open_table(META_TABLE)?;
        txn.open_table(CHAINS_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    fn read_meta(&self) -> Result<Option<Meta>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        match table.get(META_KEY)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn write_meta(&self, meta: &Meta) -> Result<(), StoreError> {
        let data = encode(meta)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META_TABLE)?;
            table.insert(META_KEY, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn run_migrations(&self, from: u32, to: u32) -> Result<(), StoreError> {
        let mut version = from;
        while version < to {
            match version {
                0 => {}
                _ => {
                    return Err(StoreError::UnsupportedSchemaVersion { version });
                }
            }
            version += 1;
        }
        Ok(())
    }
}

fn app_dir(root_dir: &Path) -> PathBuf {
    root_dir.join(APP_DIR)
}

fn db_path(root_dir: &Path) -> PathBuf {
    app_dir(root_dir).join("db.redb")
}

fn blobs_dir(root_dir: &Path) -> PathBuf {
    app_dir(root_dir).join(BLOBS_DIR)
}

fn backup_db(db_path: &Path) -> Result<(), StoreError> {
    let ts = now_epoch_secs()?;
    let file_name = format!("db.redb.bak.{ts}");
    let backup_path = db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(file_name);
    std::fs::rename(db_path, backup_path)?;
    Ok(())
}

fn now_epoch_secs() -> Result<u64, StoreError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(std::io::Error::other)?;
    Ok(now.as_secs())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, StoreError> {
    Ok(rmp_serde::from_slice(data)?)
}
