use itertools::Itertools;
use log::warn;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::cfg::CfgExtraction;

/// Upper bound of the prime sieve. Gives ~82k primes, far beyond any real
/// mnemonic vocabulary or cyclomatic complexity.
const PRIME_SIEVE_LIMIT: usize = 1 << 20;

const SQRT2: f64 = std::f64::consts::SQRT_2;

pub fn primes_below(limit: usize) -> Vec<u64> {
    let mut sieve = vec![true; limit];
    let mut primes = Vec::new();
    for n in 2..limit {
        if sieve[n] {
            primes.push(n as u64);
            let mut m = n * n;
            while m < limit {
                sieve[m] = false;
                m += n;
            }
        }
    }
    primes
}

/// Derives the prime-family hashes. One engine per export session; the
/// vocabulary is the sorted CPU mnemonic list.
pub struct HashEngine {
    primes: Vec<u64>,
    vocab: FxHashMap<String, usize>,
}

impl HashEngine {
    pub fn new(cpu_instruction_set: Vec<String>) -> Self {
        let vocab = cpu_instruction_set
            .into_iter()
            .sorted()
            .dedup()
            .enumerate()
            .map(|(i, m)| (m, i))
            .collect();
        Self {
            primes: primes_below(PRIME_SIEVE_LIMIT),
            vocab,
        }
    }

    /// Order-insensitive multiset fingerprint of the instruction stream:
    /// the product of one prime per mnemonic occurrence. Mnemonics outside
    /// the vocabulary contribute nothing.
    pub fn mnemonics_spp(&self, mnemonics: &[String]) -> u64 {
        let mut product = 1u64;
        for mnem in mnemonics {
            if let Some(&idx) = self.vocab.get(mnem.as_str()) {
                if let Some(&p) = self.primes.get(idx) {
                    product = product.wrapping_mul(p);
                }
            }
        }
        product
    }

    /// Product over SCCs of size > 1 of the prime indexed by that size.
    /// 0 is the documented fallback when the topology step degraded.
    pub fn scc_spp(&self, sccs: &[Vec<usize>]) -> u64 {
        let mut product = 1u64;
        for scc in sccs {
            if scc.len() > 1 {
                if let Some(&p) = self.primes.get(scc.len()) {
                    product = product.wrapping_mul(p);
                }
            }
        }
        product
    }

    /// Prime at index `cc`, or the 0 sentinel when the complexity outgrows
    /// the table. Never fails the export.
    pub fn cc_prime(&self, cc: i64) -> u64 {
        if cc < 0 {
            return 0;
        }
        match self.primes.get(cc as usize) {
            Some(&p) => p,
            None => {
                warn!("cyclomatic complexity too big: {}", cc);
                0
            }
        }
    }

    /// Prime product over decompiler AST opcode ids.
    pub fn pseudocode_primes(&self, ast_ops: &[usize]) -> u64 {
        let mut product = 1u64;
        for &op in ast_ops {
            if let Some(&p) = self.primes.get(op) {
                product = product.wrapping_mul(p);
            }
        }
        product
    }
}

/// SCCs plus the topological order of the condensed graph.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Strongly connected components, as block ordinals.
    pub sccs: Vec<Vec<usize>>,
    /// SCC groups in topological order; this is what gets persisted.
    pub groups: Vec<Vec<usize>>,
    /// Block ordinal -> index of its group in `groups`.
    pub order: Vec<usize>,
}

/// Iterative Tarjan over the ordinal adjacency. Cycles collapse into SCCs,
/// so the condensed order always exists. Returns `None` only when the
/// adjacency is inconsistent (an edge points at a block ordinal that does
/// not exist), which is the degraded-fallback path rather than an error.
pub fn scc_topology(adjacency: &[Vec<usize>]) -> Option<Topology> {
    let n = adjacency.len();
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(n, n);
    let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
    for (src, succs) in adjacency.iter().enumerate() {
        for &dst in succs {
            if dst >= n {
                return None;
            }
            graph.add_edge(nodes[src], nodes[dst], ());
        }
    }

    // tarjan_scc yields components in reverse topological order.
    let mut groups: Vec<Vec<usize>> = tarjan_scc(&graph)
        .into_iter()
        .map(|scc| scc.into_iter().map(|ix| graph[ix]).collect())
        .collect();
    groups.reverse();

    let mut order = vec![0usize; n];
    for (pos, group) in groups.iter().enumerate() {
        for &b in group {
            order[b] = pos;
        }
    }

    Some(Topology {
        sccs: groups.clone(),
        groups,
        order,
    })
}

/// Loop count: SCCs of size > 1, plus degenerate singleton SCCs whose block
/// is its own successor. A singleton reached by an external back-edge but
/// without a self-loop is not a loop.
pub fn count_loops(sccs: &[Vec<usize>], adjacency: &[Vec<usize>]) -> u64 {
    let mut loops = 0;
    for scc in sccs {
        if scc.len() > 1 {
            loops += 1;
        } else if adjacency[scc[0]].contains(&scc[0]) {
            loops += 1;
        }
    }
    loops
}

/// The MD-index: for each control-flow edge, embed the degree 5-tuple with
/// irrational weights and sum the reciprocal square roots. Permutations of
/// structurally different graphs are extremely unlikely to collide.
pub fn md_index(cfg: &CfgExtraction, topo: &Topology) -> f64 {
    let rt3 = 3f64.sqrt();
    let rt5 = 5f64.sqrt();
    let rt7 = 7f64.sqrt();

    let mut sum = 0.0;
    for &(src, dst) in &cfg.bb_edges {
        let (src_in, src_out) = cfg.bb_degrees[&src];
        let (dst_in, dst_out) = cfg.bb_degrees[&dst];
        let z0 = topo.order[cfg.bb_index[&src]] as f64;

        let emb = z0
            + src_in as f64 * SQRT2
            + src_out as f64 * rt3
            + dst_in as f64 * rt5
            + dst_out as f64 * rt7;
        if emb > 0.0 {
            sum += 1.0 / emb.sqrt();
        }
    }
    sum
}

pub fn byte_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Koret-Karamitas structural hash: a digest over per-block degree pairs and
/// instruction categories, in block address order.
pub fn kgh_hash(cfg: &CfgExtraction) -> String {
    let mut hasher = Sha256::new();
    for (rva, rows) in &cfg.basic_blocks {
        let (ind, outd) = cfg.bb_degrees.get(rva).copied().unwrap_or((0, 0));
        hasher.update([ind.min(255) as u8, outd.min(255) as u8]);
        for row in rows {
            hasher.update([instruction_category(&row.mnemonic)]);
        }
    }
    hex::encode(hasher.finalize())
}

fn instruction_category(mnemonic: &str) -> u8 {
    let m = mnemonic.to_ascii_lowercase();
    if m.starts_with("call") || m == "bl" || m == "blx" {
        b'C'
    } else if m == "jmp" || m == "b" || m == "br" {
        b'J'
    } else if m.starts_with('j') || m.starts_with("b.") {
        b'c'
    } else if m.starts_with("ret") {
        b'R'
    } else if m.starts_with("mov") || m.starts_with("ld") || m.starts_with("st") || m == "push" || m == "pop" {
        b'M'
    } else if ["add", "sub", "mul", "div", "imul", "idiv", "inc", "dec", "neg", "lea"]
        .iter()
        .any(|p| m.starts_with(p))
    {
        b'A'
    } else if ["and", "or", "xor", "not", "shl", "shr", "sar", "rol", "ror", "test", "cmp"]
        .iter()
        .any(|p| m.starts_with(p))
    {
        b'L'
    } else if m == "nop" {
        b'N'
    } else {
        b'O'
    }
}

/// Fuzzy hash triple over pseudocode text: one digest of the normalized
/// text, one of the odd lines, one of every fourth line. Small edits leave
/// at least one member intact.
pub fn fuzzy_hash_triple(text: &str) -> (String, String, String) {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let digest = |step: usize| -> String {
        let mut hasher = Sha256::new();
        for line in lines.iter().step_by(step) {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    };
    (digest(1), digest(2), digest(4))
}

/// Normalized listing for text comparison: labels and comments dropped,
/// address-bearing tokens anonymized.
pub fn clean_assembly(asm: &str) -> String {
    asm.lines()
        .filter(|l| !l.trim_end().ends_with(':'))
        .map(clean_asm_line)
        .join("\n")
}

fn clean_asm_line(line: &str) -> String {
    let code = line.split(';').next().unwrap_or("").trim();
    code.split_whitespace()
        .map(|tok| {
            let comma = tok.ends_with(',');
            let bare = tok.trim_end_matches(',');
            if is_address_token(bare) {
                if comma {
                    "XXXX,".to_string()
                } else {
                    "XXXX".to_string()
                }
            } else {
                tok.to_string()
            }
        })
        .join(" ")
}

fn is_address_token(tok: &str) -> bool {
    if let Some(hexpart) = tok.strip_prefix("0x") {
        return !hexpart.is_empty() && hexpart.chars().all(|c| c.is_ascii_hexdigit());
    }
    for prefix in ["loc_", "sub_", "off_", "unk_", "byte_", "word_", "dword_", "qword_"] {
        if let Some(rest) = tok.strip_prefix(prefix) {
            return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit());
        }
    }
    false
}
