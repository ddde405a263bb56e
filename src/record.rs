use log::warn;

use crate::cfg;
use crate::hashes::{self, HashEngine};
use crate::{FunctionRecord, PseudocodeInfo, RawFunction, SCHEMA_VERSION};

/// Per-project policy hook. `before_export` can veto a function,
/// `after_export` may rewrite any field of the finished record. The rewrite
/// is applied exactly once, never recursively.
pub trait ExportHooks {
    fn before_export(&mut self, address: u64, name: &str) -> bool {
        let _ = (address, name);
        true
    }

    fn after_export(&mut self, record: FunctionRecord) -> FunctionRecord {
        record
    }
}

/// Aggregates extractor output, hash engine output and host-provided scalars
/// into one immutable record.
pub struct RecordBuilder<'a> {
    engine: &'a HashEngine,
    image_base: u64,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(engine: &'a HashEngine, image_base: u64) -> Self {
        Self { engine, image_base }
    }

    /// Returns `None` when the policy hook vetoed the function.
    pub fn build(
        &self,
        func: &RawFunction,
        hooks: Option<&mut (dyn ExportHooks + '_)>,
    ) -> Option<FunctionRecord> {
        let mut hooks = hooks;
        if let Some(h) = hooks.as_deref_mut() {
            if !h.before_export(func.address, &func.name) {
                return None;
            }
        }

        let extraction = cfg::extract(func, self.image_base);
        let rva = func.address.wrapping_sub(self.image_base);

        let topology = hashes::scc_topology(&extraction.bb_adjacency);
        if topology.is_none() {
            warn!("0x{:08x}: topological sort degraded, using fallback hashes", func.address);
        }

        let (bb_topological, strongly_connected_spp, md_index, loops, scc_size) = match &topology {
            Some(topo) => (
                Some(topo.groups.clone()),
                self.engine.scc_spp(&topo.sccs),
                hashes::md_index(&extraction, topo),
                hashes::count_loops(&topo.sccs, &extraction.bb_adjacency),
                topo.sccs.len() as u64,
            ),
            None => (None, 0, 0.0, 0, 0),
        };

        let cc = extraction.edges as i64 - extraction.nodes as i64 + 2;

        let pseudocode = func.pseudocode.as_ref().map(|p| {
            let text = p.lines.join("\n");
            let (hash1, hash2, hash3) = hashes::fuzzy_hash_triple(&text);
            PseudocodeInfo {
                lines: p.lines.len(),
                primes: self.engine.pseudocode_primes(&p.ast_ops),
                hash1,
                hash2,
                hash3,
                comments: p
                    .comments
                    .iter()
                    .map(|(ea, text, itp)| (ea.wrapping_sub(self.image_base), text.clone(), *itp))
                    .collect(),
                text,
            }
        });

        let rebase = |addrs: &[u64]| -> Vec<u64> {
            let mut out: Vec<u64> = addrs
                .iter()
                .map(|a| a.wrapping_sub(self.image_base))
                .filter(|&a| a != rva)
                .collect();
            out.sort_unstable();
            out.dedup();
            out
        };

        let record = FunctionRecord {
            schema_version: SCHEMA_VERSION,

            name: func.name.clone(),
            mangled_name: func.mangled_name.clone(),
            rva,
            prototype: func.prototype.clone(),
            prototype2: func.prototype2.clone(),
            comment: func.comment.clone(),
            function_flags: func.function_flags,

            nodes: extraction.nodes,
            edges: extraction.edges,
            indegree: extraction.indegree,
            outdegree: extraction.outdegree,
            size: extraction.size,
            instructions: extraction.instructions,
            cyclomatic_complexity: cc,

            mnemonics_spp: self.engine.mnemonics_spp(&extraction.mnemonics),
            strongly_connected_spp,
            prime: self.engine.cc_prime(cc),
            md_index,
            kgh_hash: hashes::kgh_hash(&extraction),
            function_hash: hashes::byte_hash(&extraction.raw_bytes),
            bytes_hash: hashes::byte_hash(&extraction.normalized_bytes),
            bytes_sum: extraction.bytes_sum,

            clean_assembly: hashes::clean_assembly(&extraction.assembly),
            mnemonics: extraction.mnemonics,
            assembly: extraction.assembly,
            assembly_addrs: extraction.assembly_addrs,
            names: extraction.names,
            constants: extraction.constants,
            switches: extraction.switches,

            basic_blocks: extraction.basic_blocks,
            bb_relations: extraction.bb_relations,
            bb_topological,
            loops,
            strongly_connected_size: scc_size,

            callers: rebase(&func.callers),
            callees: rebase(&func.callees),

            pseudocode,
        };

        Some(match hooks {
            Some(h) => h.after_export(record),
            None => record,
        })
    }
}
