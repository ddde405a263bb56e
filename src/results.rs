//! Versioned interchange file for diffing results. Matching itself happens
//! elsewhere; this module only persists and reloads what a matcher produced
//! so a later session can re-apply or import from it.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const RESULTS_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Best,
    Partial,
    Unreliable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRow {
    pub kind: MatchKind,
    pub address: u64,
    pub name: String,
    pub address2: u64,
    pub name2: String,
    /// Which heuristic produced the match.
    pub description: String,
    pub ratio: f64,
    pub bb1: u64,
    pub bb2: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedRow {
    pub side: Side,
    pub address: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsFile {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub primary_db: String,
    pub secondary_db: String,
    pub matches: Vec<MatchRow>,
    pub unmatched: Vec<UnmatchedRow>,
}

impl ResultsFile {
    pub fn new(primary_db: impl Into<String>, secondary_db: impl Into<String>) -> Self {
        Self {
            version: RESULTS_VERSION,
            created_at: Utc::now(),
            primary_db: primary_db.into(),
            secondary_db: secondary_db.into(),
            matches: Vec::new(),
            unmatched: Vec::new(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create results file {:?}", path))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .with_context(|| format!("failed to write results file {:?}", path))?;
        info!(
            "saved {} match(es) and {} unmatched row(s) to {:?}",
            self.matches.len(),
            self.unmatched.len(),
            path
        );
        Ok(())
    }

    /// A version mismatch only warns; old files stay loadable as long as the
    /// fields still deserialize.
    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open results file {:?}", path))?;
        let results: ResultsFile = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse results file {:?}", path))?;
        if results.version != RESULTS_VERSION {
            warn!(
                "results file {:?} has version {}, current is {}; results may load incorrectly",
                path, results.version, RESULTS_VERSION
            );
        }
        Ok(results)
    }
}
