use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::hashes::HashEngine;
use crate::record::{ExportHooks, RecordBuilder};
use crate::store::{clear_output, FunctionStore, ProgramMetadata};
use crate::{ExportError, FunctionProvider, SCHEMA_VERSION};

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub output: PathBuf,
    /// Optional address window restricting which functions get exported.
    pub min_address: Option<u64>,
    pub max_address: Option<u64>,
}

impl ExportOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            min_address: None,
            max_address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutcome {
    /// Functions written by this session (excludes resumed-over ones).
    pub exported: u64,
    pub total: u64,
    pub resumed: bool,
}

/// The sentinel whose existence marks "export in progress". Created before
/// the first function, deleted only on clean completion or explicit
/// cancellation; finding it at startup is the crash signal.
pub fn crash_sentinel_path(output: &Path) -> PathBuf {
    PathBuf::from(format!("{}-crash", output.display()))
}

fn is_disassembler_artifact(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "idb" | "i64" | "til" | "id0" | "id1" | "nam")
}

fn validate_output(path: &Path) -> Result<(), ExportError> {
    if path.file_name().is_none() || path.as_os_str().len() < 5 {
        return Err(ExportError::InvalidOutput(path.to_path_buf()));
    }
    if is_disassembler_artifact(path) {
        return Err(ExportError::NotADatabase(path.to_path_buf()));
    }
    Ok(())
}

/// Up-front checks for a diff between two export databases. Nothing must
/// start when these fail.
pub fn validate_diff_targets(primary: &Path, secondary: &Path) -> Result<(), ExportError> {
    validate_output(primary)?;
    validate_output(secondary)?;
    if primary == secondary {
        return Err(ExportError::SameDatabase(primary.to_path_buf()));
    }
    Ok(())
}

/// Drives extraction over every function in address order, committing
/// batches to the store and checkpointing through the crash sentinel.
pub struct Exporter<'a, P: FunctionProvider> {
    provider: &'a P,
    options: ExportOptions,
    hooks: Option<&'a mut dyn ExportHooks>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a, P: FunctionProvider> Exporter<'a, P> {
    pub fn new(provider: &'a P, options: ExportOptions) -> Self {
        Self {
            provider,
            options,
            hooks: None,
            cancel: None,
        }
    }

    pub fn with_hooks(mut self, hooks: &'a mut dyn ExportHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Cancellation is honored between functions only; setting the flag
    /// discards the checkpoint so the next run starts from scratch.
    pub fn with_cancel_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn export(mut self) -> Result<ExportOutcome> {
        validate_output(&self.options.output)?;

        let output = self.options.output.clone();
        let sentinel = crash_sentinel_path(&output);
        let resume = output.exists() && sentinel.exists();

        let mut callgraph_product = 1u64;
        let mut callgraph_histogram: BTreeMap<u64, u64> = BTreeMap::new();
        let mut exported_rvas: Vec<u64> = Vec::new();
        let mut last_committed_rva = None;

        if resume {
            info!("resuming a previously crashed session on {:?}", output);
            let committed = FunctionStore::load_records(&output)?;
            match committed.last() {
                Some(last) => {
                    last_committed_rva = Some(last.rva);
                    // Do not trust partially committed aggregates; rebuild
                    // the call-graph signature from what actually landed.
                    for rec in &committed {
                        callgraph_product = callgraph_product.wrapping_mul(rec.prime);
                        *callgraph_histogram.entry(rec.prime).or_insert(0) += 1;
                        exported_rvas.push(rec.rva);
                    }
                }
                None => {
                    warn!("cannot resume the previous crashed session, starting from scratch");
                }
            }
        } else if output.exists() {
            clear_output(&output)?;
        }

        info!("creating crash sentinel {:?}", sentinel);
        std::fs::File::create(&sentinel)
            .with_context(|| format!("failed to create crash sentinel {:?}", sentinel))?;

        let mut store = if last_committed_rva.is_some() {
            FunctionStore::open_append(&output)?
        } else {
            FunctionStore::create(&output)?
        };
        store.commit()?;

        let image_base = self.provider.image_base();
        let engine = HashEngine::new(self.provider.cpu_instruction_set());
        let builder = RecordBuilder::new(&engine, image_base);

        let mut addresses = self.provider.function_addresses();
        addresses.sort_unstable();
        addresses.retain(|&a| {
            self.options.min_address.map_or(true, |min| a >= min)
                && self.options.max_address.map_or(true, |max| a <= max)
        });
        let total = addresses.len() as u64;

        let started = Instant::now();
        let mut exported = 0u64;

        for (i, &address) in addresses.iter().enumerate() {
            let i = i as u64 + 1;

            if let Some(flag) = self.cancel {
                if flag.load(Ordering::Relaxed) {
                    info!("aborted by user, removing crash sentinel {:?}", sentinel);
                    let _ = std::fs::remove_file(&sentinel);
                    return Err(ExportError::Cancelled.into());
                }
            }

            if total > 100 && (i == 1 || i % (total / 100).max(1) == 0) {
                let elapsed = started.elapsed().as_secs_f64();
                let remaining = elapsed / i as f64 * (total - i) as f64;
                info!(
                    "exported {} function(s) out of {} total, elapsed {:.0}s, remaining ~{:.0}s",
                    i, total, elapsed, remaining
                );
            }

            let rva = address.wrapping_sub(image_base);
            if let Some(last) = last_committed_rva {
                // Skip everything up to and including the last function the
                // crashed session managed to commit.
                if rva <= last {
                    continue;
                }
            }

            let func = match self.provider.read_function(address) {
                Ok(Some(func)) => func,
                Ok(None) => continue,
                Err(e) => {
                    warn!("cannot read function at 0x{:x}: {:#}", address, e);
                    continue;
                }
            };

            let record = match builder.build(&func, self.hooks.as_deref_mut()) {
                Some(record) => record,
                None => continue,
            };

            callgraph_product = callgraph_product.wrapping_mul(record.prime);
            *callgraph_histogram.entry(record.prime).or_insert(0) += 1;
            exported_rvas.push(record.rva);

            store.append(&record)?;
            exported += 1;

            if total > 5000 && i % (total / 10) == 0 {
                store.commit()?;
            }
        }

        let index = exported_rvas
            .iter()
            .enumerate()
            .map(|(ordinal, &rva)| (rva, ordinal as u64))
            .collect();

        store.write_metadata(&ProgramMetadata {
            schema_version: SCHEMA_VERSION,
            input_hash: self.provider.input_hash(),
            processor: self.provider.processor(),
            callgraph_product,
            callgraph_histogram,
            type_definitions: self.provider.type_definitions(),
            type_libraries: self.provider.type_libraries(),
            index,
            created_at: chrono::Utc::now(),
        })?;

        info!("removing crash sentinel {:?}", sentinel);
        std::fs::remove_file(&sentinel)
            .with_context(|| format!("failed to remove crash sentinel {:?}", sentinel))?;

        info!(
            "database exported, {} function(s) in {:.2}s",
            exported,
            started.elapsed().as_secs_f64()
        );

        Ok(ExportOutcome {
            exported,
            total,
            resumed: last_committed_rva.is_some(),
        })
    }
}
