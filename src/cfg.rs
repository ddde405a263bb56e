use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{Constant, InstructionData, RawFunction, SwitchInfo, BAD_ADDRESS};

/// Everything the extractor pulls out of one function's control flow graph,
/// before any hashing happens.
#[derive(Debug, Default)]
pub struct CfgExtraction {
    pub nodes: u64,
    pub edges: u64,
    pub indegree: u64,
    pub outdegree: u64,
    pub size: u64,
    pub instructions: u64,

    pub mnemonics: Vec<String>,
    pub names: BTreeSet<String>,
    pub constants: BTreeSet<Constant>,
    pub switches: Vec<SwitchInfo>,

    /// Block RVA -> instruction rows.
    pub basic_blocks: BTreeMap<u64, Vec<InstructionData>>,
    /// Block RVA -> successor block RVAs (deduplicated adjacency).
    pub bb_relations: BTreeMap<u64, Vec<u64>>,
    /// Block RVA -> (in, out) degree, counted on the successor pass only.
    pub bb_degrees: FxHashMap<u64, (u64, u64)>,
    /// Control-flow edges (src RVA, dst RVA), successor pass only.
    pub bb_edges: Vec<(u64, u64)>,
    /// Block RVA -> ordinal in visit order.
    pub bb_index: FxHashMap<u64, usize>,
    /// Ordinal-indexed successor lists, input to the topological step.
    pub bb_adjacency: Vec<Vec<usize>>,

    /// Linearized listing, entry block first, and the 1:1 RVA per line.
    pub assembly: String,
    pub assembly_addrs: Vec<u64>,

    pub raw_bytes: Vec<u8>,
    pub normalized_bytes: Vec<u8>,
    pub bytes_sum: u64,
}

fn block_is_valid(end: u64) -> bool {
    end != 0 && end != BAD_ADDRESS
}

/// Immediate value filter, after REgoogle. Small values, all-ones byte
/// patterns and single-bit flags say nothing about identity.
pub fn constant_filter(value: u64) -> bool {
    if value < 0x10000 {
        return false;
    }

    if value & 0xFFFF_FF00 == 0xFFFF_FF00
        || value & 0xFF_FF00 == 0xFF_FF00
        || value & 0xFFFF_FFFF_FFFF_FF00 == 0xFFFF_FFFF_FFFF_FF00
        || value & 0xFFFF_FFFF_FFFF_00 == 0xFFFF_FFFF_FFFF_00
    {
        return false;
    }

    // Single bit set: almost always a define or a flag.
    if value.is_power_of_two() {
        return false;
    }

    true
}

fn referenced_name_is_interesting(name: &str) -> bool {
    !name.starts_with("sub_") && !name.starts_with("nullsub_")
}

/// Walks the host-supplied blocks into the internal graph representation.
///
/// A block whose end address is 0 or [`BAD_ADDRESS`] is skipped entirely: it
/// contributes no node, no edge and no degree. Edges into or out of such a
/// block are dropped on both traversal passes. The `edges`/`indegree`/
/// `outdegree` counters are bumped independently on the successor and the
/// predecessor pass; downstream weighting depends on exactly this counting.
pub fn extract(func: &RawFunction, image_base: u64) -> CfgExtraction {
    let mut out = CfgExtraction::default();

    let valid: FxHashSet<u64> = func
        .blocks
        .iter()
        .filter(|b| block_is_valid(b.end))
        .map(|b| b.start)
        .collect();

    out.indegree = func.callers.len() as u64;

    // Per-block assembly lines, linearized at the end.
    let mut assembly: BTreeMap<u64, Vec<(u64, String)>> = BTreeMap::new();
    let entry_rva = func.address.wrapping_sub(image_base);

    for block in &func.blocks {
        if !block_is_valid(block.end) {
            debug!("0x{:08x}: skipping bad basic block", func.address);
            continue;
        }

        out.nodes += 1;
        let block_rva = block.start.wrapping_sub(image_base);

        let idx = out.bb_adjacency.len();
        out.bb_adjacency.push(Vec::new());
        out.bb_index.insert(block_rva, idx);

        let mut rows = Vec::with_capacity(block.instructions.len());
        let lines = assembly.entry(block_rva).or_default();
        if block_rva != entry_rva {
            lines.push((block_rva, format!("loc_{:x}:", block.start)));
        }

        for ins in &block.instructions {
            let ins_rva = ins.address.wrapping_sub(image_base);
            out.mnemonics.push(ins.mnemonic.clone());
            out.size += ins.bytes.len() as u64;
            out.instructions += 1;
            out.outdegree += ins.code_refs.len() as u64;

            lines.push((ins_rva, ins.disasm.clone()));

            out.raw_bytes.extend_from_slice(&ins.bytes);
            out.normalized_bytes.extend_from_slice(&ins.normalized_bytes);
            out.bytes_sum += ins.normalized_bytes.iter().map(|&b| b as u64).sum::<u64>();

            for &imm in &ins.immediates {
                // A value that is also a data reference is an address, not
                // a constant.
                if !ins.data_refs.contains(&imm) && constant_filter(imm) {
                    out.constants.insert(Constant::Number(imm));
                }
            }
            if let Some(s) = &ins.string_ref {
                out.constants.insert(Constant::Str(s.clone()));
            }

            if let Some(name) = &ins.symbol_name {
                if referenced_name_is_interesting(name) {
                    out.names.insert(name.clone());
                }
            }

            if let Some(sw) = &ins.switch {
                out.switches.push(sw.clone());
            }

            rows.push(InstructionData {
                rva: ins_rva,
                mnemonic: ins.mnemonic.clone(),
                disasm: ins.disasm.clone(),
                comment: ins.comment.clone(),
                repeatable_comment: ins.repeatable_comment.clone(),
                symbol_name: ins.symbol_name.clone(),
                symbol_type: ins.symbol_type.clone(),
            });
        }

        out.basic_blocks.insert(block_rva, rows);
        out.bb_relations.entry(block_rva).or_default();
        out.bb_degrees.entry(block_rva).or_insert((0, 0));

        for &succ in &block.successors {
            if !valid.contains(&succ) {
                continue;
            }
            let succ_rva = succ.wrapping_sub(image_base);

            let rel = out.bb_relations.entry(block_rva).or_default();
            if !rel.contains(&succ_rva) {
                rel.push(succ_rva);
            }
            out.bb_degrees.entry(block_rva).or_insert((0, 0)).1 += 1;
            out.bb_degrees.entry(succ_rva).or_insert((0, 0)).0 += 1;
            out.bb_edges.push((block_rva, succ_rva));

            out.edges += 1;
            out.indegree += 1;
        }

        for &pred in &block.predecessors {
            if !valid.contains(&pred) {
                continue;
            }
            let pred_rva = pred.wrapping_sub(image_base);

            let rel = out.bb_relations.entry(pred_rva).or_default();
            if !rel.contains(&block_rva) {
                rel.push(block_rva);
            }

            out.edges += 1;
            out.outdegree += 1;
        }
    }

    // Ordinal adjacency for the topological step, successor edges only.
    for block in &func.blocks {
        if !block_is_valid(block.end) {
            continue;
        }
        let block_rva = block.start.wrapping_sub(image_base);
        let idx = out.bb_index[&block_rva];
        for &succ in &block.successors {
            if !valid.contains(&succ) {
                continue;
            }
            let succ_rva = succ.wrapping_sub(image_base);
            out.bb_adjacency[idx].push(out.bb_index[&succ_rva]);
        }
    }

    // Linearize: ascending block addresses, except the entry block always
    // comes first, no matter where it sits numerically.
    let mut keys: Vec<u64> = assembly.keys().copied().collect();
    if let Some(pos) = keys.iter().position(|&k| k == entry_rva) {
        keys.remove(pos);
        keys.insert(0, entry_rva);
    }
    let mut lines = Vec::new();
    for key in keys {
        for (rva, text) in &assembly[&key] {
            out.assembly_addrs.push(*rva);
            lines.push(text.clone());
        }
    }
    out.assembly = lines.join("\n");

    out
}
