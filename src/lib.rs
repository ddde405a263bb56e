use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cfg;
pub mod export;
pub mod hashes;
pub mod import;
pub mod record;
pub mod results;
pub mod store;
pub mod textdiff;

pub use export::{ExportOptions, ExportOutcome, Exporter};
pub use import::{AnnotationSink, DiffImporter, ImportStats};
pub use record::{ExportHooks, RecordBuilder};
pub use results::ResultsFile;
pub use store::FunctionStore;

/// Sentinel for "no such address" / malformed disassembly, the moral
/// equivalent of IDA's BADADDR.
pub const BAD_ADDRESS: u64 = u64::MAX;

/// Bumped whenever the persisted `FunctionRecord` layout changes.
pub const SCHEMA_VERSION: u32 = 1;

pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// Fatal/configuration errors. Everything else is either contained per
/// function or recovered through the crash sentinel.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no output database selected or invalid filename: {0:?}")]
    InvalidOutput(PathBuf),
    #[error("both databases are the same file: {0:?}")]
    SameDatabase(PathBuf),
    #[error("{0:?} is a disassembler artifact, not an export database")]
    NotADatabase(PathBuf),
    #[error("export cancelled by user")]
    Cancelled,
}

/// Name prefixes the disassembler invents on its own. Only addresses still
/// carrying one of these may be renamed during import.
const AUTO_NAME_PREFIXES: &[&str] = &[
    "sub_", "loc_", "j_", "nullsub_", "unknown", "unk_", "byte_", "word_", "dword_", "qword_",
    "off_", "asc_", "flt_", "dbl_",
];

pub fn is_auto_generated(name: &str) -> bool {
    AUTO_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
}

// ---------------------------------------------------------------------------
// Host-supplied function model. The disassembler integration fills these in;
// the pipeline never talks to a disassembler directly.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInstruction {
    /// Absolute address.
    pub address: u64,
    pub mnemonic: String,
    pub disasm: String,
    /// Raw item bytes.
    pub bytes: Vec<u8>,
    /// Item bytes with the variant operand bytes dropped, so two builds of
    /// the same code hash equal despite relocated immediates.
    pub normalized_bytes: Vec<u8>,
    /// Immediate operand values, candidates for the constants set.
    pub immediates: Vec<u64>,
    pub data_refs: Vec<u64>,
    pub code_refs: Vec<u64>,
    /// String literal referenced through a data ref, if any.
    pub string_ref: Option<String>,
    pub comment: Option<String>,
    pub repeatable_comment: Option<String>,
    /// Demangled name of the referenced symbol, if the operand resolves to
    /// a named address.
    pub symbol_name: Option<String>,
    pub symbol_type: Option<String>,
    pub switch: Option<SwitchInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub start: u64,
    /// `0` or [`BAD_ADDRESS`] marks a malformed block; it is skipped whole.
    pub end: u64,
    pub instructions: Vec<RawInstruction>,
    pub successors: Vec<u64>,
    pub predecessors: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPseudocode {
    /// Decompiled body, one statement per line, `//` lines already dropped.
    pub lines: Vec<String>,
    /// One opcode id per AST node, in visit order.
    pub ast_ops: Vec<usize>,
    /// Pseudocode-level comments: (absolute address, text, anchor position).
    pub comments: Vec<(u64, String, i32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFunction {
    pub address: u64,
    pub name: String,
    pub mangled_name: String,
    pub prototype: Option<String>,
    pub prototype2: Option<String>,
    pub comment: Option<String>,
    pub function_flags: u64,
    pub blocks: Vec<RawBlock>,
    /// Callers/callees as absolute function entry addresses, self excluded.
    pub callers: Vec<u64>,
    pub callees: Vec<u64>,
    pub pseudocode: Option<RawPseudocode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchInfo {
    pub cases: u64,
    pub values: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
    /// "struct", "union" or "enum".
    pub kind: String,
    pub name: String,
    pub definition: Option<String>,
}

/// Export-side view of the host disassembler.
pub trait FunctionProvider {
    fn image_base(&self) -> u64;
    /// All function entry addresses, ascending.
    fn function_addresses(&self) -> Vec<u64>;
    /// `Ok(None)` means the function could not be read (decode failure,
    /// filtered out, ...) and is skipped without aborting the batch.
    fn read_function(&self, address: u64) -> Result<Option<RawFunction>>;
    /// Digest of the input binary.
    fn input_hash(&self) -> String;
    fn processor(&self) -> String;
    /// Full mnemonic list of the target CPU; the prime vocabulary.
    fn cpu_instruction_set(&self) -> Vec<String>;
    fn type_definitions(&self) -> Vec<TypeDefinition> {
        Vec::new()
    }
    fn type_libraries(&self) -> Vec<String> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Persisted record schema.
// ---------------------------------------------------------------------------

/// JSON object keys are strings, and the internally tagged [`store`] entry
/// buffers them as such before the map is deserialized, so integer-keyed
/// maps must convert their keys explicitly to round-trip.
pub(crate) mod u64_key_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<V, S>(map: &BTreeMap<u64, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(k, v)| (k.to_string(), v)))
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<u64, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        BTreeMap::<String, V>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| k.parse::<u64>().map(|k| (k, v)).map_err(D::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Constant {
    Number(u64),
    Str(String),
}

/// Per-instruction row kept inside the record; this is what the diff
/// importer joins on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionData {
    pub rva: u64,
    pub mnemonic: String,
    pub disasm: String,
    pub comment: Option<String>,
    pub repeatable_comment: Option<String>,
    pub symbol_name: Option<String>,
    pub symbol_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PseudocodeInfo {
    pub text: String,
    pub lines: usize,
    /// Prime product over AST opcode ids.
    pub primes: u64,
    pub hash1: String,
    pub hash2: String,
    pub hash3: String,
    /// (rva, text, anchor position) of decompiler-level comments.
    pub comments: Vec<(u64, String, i32)>,
}

/// One exported function. Immutable after the builder (and the policy hook)
/// is done with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub schema_version: u32,

    // Identity
    pub name: String,
    pub mangled_name: String,
    pub rva: u64,
    pub prototype: Option<String>,
    pub prototype2: Option<String>,
    pub comment: Option<String>,
    pub function_flags: u64,

    // Size/shape metrics
    pub nodes: u64,
    pub edges: u64,
    pub indegree: u64,
    pub outdegree: u64,
    pub size: u64,
    pub instructions: u64,
    pub cyclomatic_complexity: i64,

    // Sequence data
    pub mnemonics: Vec<String>,
    pub assembly: String,
    /// Relative address of each `assembly` line, 1:1, entry block first.
    pub assembly_addrs: Vec<u64>,
    pub clean_assembly: String,
    pub names: BTreeSet<String>,
    pub constants: BTreeSet<Constant>,
    pub switches: Vec<SwitchInfo>,

    // Hashes
    pub function_hash: String,
    pub bytes_hash: String,
    pub bytes_sum: u64,
    pub mnemonics_spp: u64,
    pub strongly_connected_spp: u64,
    /// Prime at index `cc`; 0 when the complexity exceeds the prime table.
    pub prime: u64,
    pub md_index: f64,
    pub kgh_hash: String,

    // Graph data
    #[serde(with = "u64_key_map")]
    pub basic_blocks: BTreeMap<u64, Vec<InstructionData>>,
    #[serde(with = "u64_key_map")]
    pub bb_relations: BTreeMap<u64, Vec<u64>>,
    /// SCC groups (block ordinals) in topological order; `None` when the
    /// topology step degraded.
    pub bb_topological: Option<Vec<Vec<usize>>>,
    pub loops: u64,
    pub strongly_connected_size: u64,

    // Relations
    pub callers: Vec<u64>,
    pub callees: Vec<u64>,

    pub pseudocode: Option<PseudocodeInfo>,
}
