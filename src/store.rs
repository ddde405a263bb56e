use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{FunctionRecord, TypeDefinition, SCHEMA_VERSION};

/// Whole-program data persisted once, on clean completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramMetadata {
    pub schema_version: u32,
    pub input_hash: String,
    pub processor: String,
    /// Wrapping product of every committed function's `prime`.
    pub callgraph_product: u64,
    /// Exact prime -> multiplicity histogram; the real call-graph signature.
    #[serde(with = "crate::u64_key_map")]
    pub callgraph_histogram: BTreeMap<u64, u64>,
    pub type_definitions: Vec<TypeDefinition>,
    pub type_libraries: Vec<String>,
    /// RVA -> record ordinal lookup index.
    #[serde(with = "crate::u64_key_map")]
    pub index: BTreeMap<u64, u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoreEntry {
    Function(Box<FunctionRecord>),
    Program(Box<ProgramMetadata>),
}

/// Append-only store for exported function records, one JSON document per
/// line. Records buffer in memory until `commit`, which is the transaction
/// boundary: anything not committed before a crash simply is not there on
/// the next run.
pub struct FunctionStore {
    path: PathBuf,
    file: File,
    pending: Vec<String>,
}

impl FunctionStore {
    /// Starts a fresh store, truncating any previous content.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create function store {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::new(),
        })
    }

    /// Reopens an existing store to append after the last committed record.
    pub fn open_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("failed to reopen function store {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::new(),
        })
    }

    pub fn append(&mut self, record: &FunctionRecord) -> Result<()> {
        let line = serde_json::to_string(&StoreEntry::Function(Box::new(record.clone())))
            .context("failed to serialize function record")?;
        self.pending.push(line);
        Ok(())
    }

    /// Writes and syncs everything buffered since the last commit.
    pub fn commit(&mut self) -> Result<()> {
        for line in self.pending.drain(..) {
            self.file.write_all(line.as_bytes())?;
            self.file.write_all(b"\n")?;
        }
        self.file.flush()?;
        self.file
            .sync_all()
            .with_context(|| format!("failed to sync function store {:?}", self.path))?;
        Ok(())
    }

    /// Appends the program metadata entry and commits. Done exactly once,
    /// at the end of a successful export.
    pub fn write_metadata(&mut self, meta: &ProgramMetadata) -> Result<()> {
        let line = serde_json::to_string(&StoreEntry::Program(Box::new(meta.clone())))
            .context("failed to serialize program metadata")?;
        self.pending.push(line);
        self.commit()
    }

    /// Reads back every committed record, in insertion order. A trailing
    /// partial line (torn write from a crash) is ignored with a warning.
    pub fn load_records(path: &Path) -> Result<Vec<FunctionRecord>> {
        let file =
            File::open(path).with_context(|| format!("failed to open function store {:?}", path))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreEntry>(&line) {
                Ok(StoreEntry::Function(rec)) => {
                    if rec.schema_version != SCHEMA_VERSION {
                        warn!(
                            "record 0x{:x} has schema version {}, current is {}",
                            rec.rva, rec.schema_version, SCHEMA_VERSION
                        );
                    }
                    records.push(*rec);
                }
                Ok(StoreEntry::Program(_)) => {}
                Err(e) => {
                    warn!("dropping torn store line in {:?}: {}", path, e);
                    break;
                }
            }
        }
        Ok(records)
    }

    pub fn load_metadata(path: &Path) -> Result<Option<ProgramMetadata>> {
        let file =
            File::open(path).with_context(|| format!("failed to open function store {:?}", path))?;
        let mut meta = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(StoreEntry::Program(m)) = serde_json::from_str::<StoreEntry>(&line) {
                meta = Some(*m);
            }
        }
        Ok(meta)
    }
}

/// Removes a previous output. When the file itself cannot be unlinked (still
/// held open elsewhere), falls back to truncating it so the next session
/// starts from empty content anyway.
pub fn clear_output(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("removed previous output {:?}", path);
            Ok(())
        }
        Err(remove_err) => {
            warn!(
                "cannot remove {:?} ({}), truncating instead",
                path, remove_err
            );
            let file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("failed to truncate output {:?}", path))?;
            file.sync_all()?;
            Ok(())
        }
    }
}
