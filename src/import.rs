//! Propagates user metadata (comments, names, types) from a matched function
//! in the secondary database onto the primary one, at instruction
//! granularity. The two assembly listings are aligned with a line diff and
//! every aligned pair maps back to addresses through `assembly_addrs`.
//!
//! All propagation is non-destructive: existing comments are never replaced
//! and only auto-generated placeholder names are renamed.

use log::debug;
use rustc_hash::FxHashMap;

use crate::textdiff;
use crate::{is_auto_generated, FunctionRecord, InstructionData};

/// Write access to the host disassembler, plus the few reads the rename and
/// type logic needs. Addresses are absolute.
pub trait AnnotationSink {
    fn comment_at(&self, ea: u64) -> Option<String>;
    fn set_comment(&mut self, ea: u64, text: &str);

    fn repeatable_comment_at(&self, ea: u64) -> Option<String>;
    fn set_repeatable_comment(&mut self, ea: u64, text: &str);

    fn set_pseudocode_comment(&mut self, ea: u64, text: &str, position: i32);

    /// User-assigned name at `ea`, `None` when the address is unnamed.
    fn name_at(&self, ea: u64) -> Option<String>;
    /// Returns false when the host rejects the name (collision etc).
    fn set_name(&mut self, ea: u64, name: &str) -> bool;

    fn type_at(&self, ea: u64) -> Option<String>;
    fn set_type(&mut self, ea: u64, ty: &str);

    fn data_refs_from(&self, ea: u64) -> Vec<u64>;
    fn code_refs_from(&self, ea: u64) -> Vec<u64>;

    /// When `ea` is an offset operand pointing into an object, the address of
    /// the underlying object that should receive the name instead.
    fn offset_base(&self, ea: u64) -> Option<u64>;

    fn set_function_comment(&mut self, ea: u64, text: &str);
    fn set_function_flags(&mut self, ea: u64, flags: u64);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub comments: u64,
    pub repeatable_comments: u64,
    pub pseudocode_comments: u64,
    pub names: u64,
    pub types: u64,
}

/// One annotated instruction of the secondary database, joined with the
/// pseudocode comment attached to the same address, if any.
struct Annotated<'a> {
    ins: &'a InstructionData,
    pseudocode_comment: Option<(&'a str, i32)>,
}

impl Annotated<'_> {
    fn has_metadata(&self) -> bool {
        self.ins.comment.is_some()
            || self.ins.repeatable_comment.is_some()
            || self.ins.symbol_name.is_some()
            || self.pseudocode_comment.is_some()
    }
}

pub struct DiffImporter<'a, S: AnnotationSink> {
    sink: &'a mut S,
    image_base: u64,
}

impl<'a, S: AnnotationSink> DiffImporter<'a, S> {
    pub fn new(sink: &'a mut S, image_base: u64) -> Self {
        Self { sink, image_base }
    }

    /// Imports function-level metadata, then walks the aligned listings and
    /// imports instruction-level metadata. `primary` is the function being
    /// updated, `secondary` the matched one carrying the annotations.
    pub fn import_function(
        &mut self,
        primary: &FunctionRecord,
        secondary: &FunctionRecord,
    ) -> ImportStats {
        let mut stats = ImportStats::default();
        let ea1 = self.image_base.wrapping_add(primary.rva);

        let name = &secondary.mangled_name;
        if !name.is_empty() && !is_auto_generated(name) {
            if self.sink.set_name(ea1, name) {
                stats.names += 1;
            } else {
                // Collision with an unrelated symbol; a numeric suffix is
                // better than losing the name.
                for i in 0..10 {
                    if self.sink.set_name(ea1, &format!("{}_{}", name, i)) {
                        stats.names += 1;
                        break;
                    }
                }
            }
        }

        if let Some(proto) = &secondary.prototype {
            // The decompiler's placeholder for "no prototype recovered".
            if proto != "int()" {
                self.sink.set_type(ea1, proto);
                stats.types += 1;
            }
        }

        if let Some(comment) = &secondary.comment {
            if !comment.is_empty() {
                self.sink.set_function_comment(ea1, comment);
            }
        }

        self.sink.set_function_flags(ea1, secondary.function_flags);

        self.import_instruction_level(primary, secondary, &mut stats);
        stats
    }

    /// Aligns the two assembly listings and propagates per-instruction
    /// metadata for every eligible row: either the line changed between the
    /// two databases, or the secondary instruction carries metadata worth
    /// copying even though the line is identical.
    pub fn import_instruction_level(
        &mut self,
        primary: &FunctionRecord,
        secondary: &FunctionRecord,
        stats: &mut ImportStats,
    ) {
        let pseudocode_comments: FxHashMap<u64, (&str, i32)> = secondary
            .pseudocode
            .iter()
            .flat_map(|p| p.comments.iter())
            .map(|(rva, text, itp)| (*rva, (text.as_str(), *itp)))
            .collect();

        let mut annotated: FxHashMap<u64, Annotated> = FxHashMap::default();
        for rows in secondary.basic_blocks.values() {
            for ins in rows {
                let entry = Annotated {
                    ins,
                    pseudocode_comment: pseudocode_comments.get(&ins.rva).copied(),
                };
                if entry.has_metadata() {
                    annotated.insert(ins.rva, entry);
                }
            }
        }
        if annotated.is_empty() {
            debug!(
                "0x{:08x}: nothing to import from 0x{:08x}",
                primary.rva, secondary.rva
            );
            return;
        }

        let lines1: Vec<&str> = primary.assembly.lines().collect();
        let lines2: Vec<&str> = secondary.assembly.lines().collect();
        let rows = textdiff::side_by_side(&lines1, &lines2);

        for row in rows {
            let (left, right) = match (row.left, row.right) {
                (Some(l), Some(r)) => (l, r),
                _ => continue,
            };
            let (rva1, rva2) = match (
                primary.assembly_addrs.get(left),
                secondary.assembly_addrs.get(right),
            ) {
                (Some(&a), Some(&b)) => (a, b),
                _ => continue,
            };

            // Eligible rows: a changed pair, or an identical line whose
            // secondary side carries metadata. Either way there is nothing
            // to do without an annotated source instruction.
            if let Some(source) = annotated.get(&rva2) {
                self.import_instruction(self.image_base.wrapping_add(rva1), source, stats);
            }
        }
    }

    fn import_instruction(&mut self, ea1: u64, source: &Annotated, stats: &mut ImportStats) {
        if let Some(text) = &source.ins.comment {
            if self.sink.comment_at(ea1).is_none() {
                self.sink.set_comment(ea1, text);
                stats.comments += 1;
            }
        }
        if let Some(text) = &source.ins.repeatable_comment {
            if self.sink.repeatable_comment_at(ea1).is_none() {
                self.sink.set_repeatable_comment(ea1, text);
                stats.repeatable_comments += 1;
            }
        }
        if let Some((text, position)) = source.pseudocode_comment {
            self.sink.set_pseudocode_comment(ea1, text, position);
            stats.pseudocode_comments += 1;
        }

        let name = match &source.ins.symbol_name {
            Some(name) => name,
            None => return,
        };

        // The rename target: a referenced global first, a called function
        // second. A type is only set on an address the rename made ours.
        let mut owned = None;
        let data_refs = self.sink.data_refs_from(ea1);
        if let Some(&target) = data_refs.first() {
            match self.sink.name_at(target) {
                Some(current) => {
                    if current != *name && is_auto_generated(&current) {
                        if self.sink.set_name(target, name) {
                            stats.names += 1;
                        }
                    }
                }
                None => {
                    // Offset operands name the underlying object, not the
                    // offset expression.
                    let target = self.sink.offset_base(target).unwrap_or(target);
                    if self.sink.set_name(target, name) {
                        stats.names += 1;
                        owned = Some(target);
                    }
                }
            }
        } else {
            let code_refs = self.sink.code_refs_from(ea1);
            if let Some(&callee) = code_refs.first() {
                if let Some(current) = self.sink.name_at(callee) {
                    if current != *name && is_auto_generated(&current) {
                        if self.sink.set_name(callee, name) {
                            stats.names += 1;
                            owned = Some(callee);
                        }
                    }
                }
            }
        }

        if let (Some(target), Some(ty)) = (owned, &source.ins.symbol_type) {
            if self.sink.type_at(target).as_deref() != Some(ty.as_str()) {
                self.sink.set_type(target, ty);
                stats.types += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SCHEMA_VERSION;
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Default)]
    struct MockSink {
        comments: FxHashMap<u64, String>,
        repeatable: FxHashMap<u64, String>,
        pseudocode: FxHashMap<u64, (String, i32)>,
        names: FxHashMap<u64, String>,
        types: FxHashMap<u64, String>,
        data_refs: FxHashMap<u64, Vec<u64>>,
        code_refs: FxHashMap<u64, Vec<u64>>,
        offset_bases: FxHashMap<u64, u64>,
        function_comments: FxHashMap<u64, String>,
        function_flags: FxHashMap<u64, u64>,
        rejected_names: Vec<String>,
    }

    impl AnnotationSink for MockSink {
        fn comment_at(&self, ea: u64) -> Option<String> {
            self.comments.get(&ea).cloned()
        }
        fn set_comment(&mut self, ea: u64, text: &str) {
            self.comments.insert(ea, text.to_string());
        }
        fn repeatable_comment_at(&self, ea: u64) -> Option<String> {
            self.repeatable.get(&ea).cloned()
        }
        fn set_repeatable_comment(&mut self, ea: u64, text: &str) {
            self.repeatable.insert(ea, text.to_string());
        }
        fn set_pseudocode_comment(&mut self, ea: u64, text: &str, position: i32) {
            self.pseudocode.insert(ea, (text.to_string(), position));
        }
        fn name_at(&self, ea: u64) -> Option<String> {
            self.names.get(&ea).cloned()
        }
        fn set_name(&mut self, ea: u64, name: &str) -> bool {
            if self.rejected_names.iter().any(|n| n == name) {
                return false;
            }
            self.names.insert(ea, name.to_string());
            true
        }
        fn type_at(&self, ea: u64) -> Option<String> {
            self.types.get(&ea).cloned()
        }
        fn set_type(&mut self, ea: u64, ty: &str) {
            self.types.insert(ea, ty.to_string());
        }
        fn data_refs_from(&self, ea: u64) -> Vec<u64> {
            self.data_refs.get(&ea).cloned().unwrap_or_default()
        }
        fn code_refs_from(&self, ea: u64) -> Vec<u64> {
            self.code_refs.get(&ea).cloned().unwrap_or_default()
        }
        fn offset_base(&self, ea: u64) -> Option<u64> {
            self.offset_bases.get(&ea).copied()
        }
        fn set_function_comment(&mut self, ea: u64, text: &str) {
            self.function_comments.insert(ea, text.to_string());
        }
        fn set_function_flags(&mut self, ea: u64, flags: u64) {
            self.function_flags.insert(ea, flags);
        }
    }

    fn ins(rva: u64, mnemonic: &str, disasm: &str) -> InstructionData {
        InstructionData {
            rva,
            mnemonic: mnemonic.to_string(),
            disasm: disasm.to_string(),
            comment: None,
            repeatable_comment: None,
            symbol_name: None,
            symbol_type: None,
        }
    }

    fn record(rva: u64, rows: Vec<InstructionData>) -> FunctionRecord {
        let assembly: Vec<String> = rows.iter().map(|i| i.disasm.clone()).collect();
        let assembly_addrs: Vec<u64> = rows.iter().map(|i| i.rva).collect();
        FunctionRecord {
            schema_version: SCHEMA_VERSION,
            name: format!("sub_{:x}", rva),
            mangled_name: format!("sub_{:x}", rva),
            rva,
            prototype: None,
            prototype2: None,
            comment: None,
            function_flags: 0,
            nodes: 1,
            edges: 0,
            indegree: 0,
            outdegree: 0,
            size: rows.len() as u64 * 4,
            instructions: rows.len() as u64,
            cyclomatic_complexity: 1,
            mnemonics: rows.iter().map(|i| i.mnemonic.clone()).collect(),
            assembly: assembly.join("\n"),
            assembly_addrs,
            clean_assembly: String::new(),
            names: BTreeSet::new(),
            constants: BTreeSet::new(),
            switches: Vec::new(),
            function_hash: String::new(),
            bytes_hash: String::new(),
            bytes_sum: 0,
            mnemonics_spp: 1,
            strongly_connected_spp: 1,
            prime: 3,
            md_index: 0.0,
            kgh_hash: String::new(),
            basic_blocks: BTreeMap::from([(rva, rows)]),
            bb_relations: BTreeMap::new(),
            bb_topological: Some(vec![vec![0]]),
            loops: 0,
            strongly_connected_size: 1,
            callers: Vec::new(),
            callees: Vec::new(),
            pseudocode: None,
        }
    }

    const BASE: u64 = 0x400000;

    #[test]
    fn identical_line_with_comment_still_imports() {
        let primary = record(0x1000, vec![ins(0x1000, "call", "call helper")]);
        let mut src = ins(0x1000, "call", "call helper");
        src.comment = Some("validates the header".to_string());
        let secondary = record(0x1000, vec![src]);

        let mut sink = MockSink::default();
        let mut stats = ImportStats::default();
        DiffImporter::new(&mut sink, BASE).import_instruction_level(
            &primary,
            &secondary,
            &mut stats,
        );
        assert_eq!(
            sink.comments.get(&(BASE + 0x1000)).map(String::as_str),
            Some("validates the header")
        );
        assert_eq!(stats.comments, 1);
    }

    #[test]
    fn existing_comment_is_never_overwritten() {
        let primary = record(0x1000, vec![ins(0x1000, "call", "call helper")]);
        let mut src = ins(0x1000, "call", "call helper");
        src.comment = Some("new text".to_string());
        let secondary = record(0x1000, vec![src]);

        let mut sink = MockSink::default();
        sink.comments
            .insert(BASE + 0x1000, "my own analysis".to_string());
        let mut stats = ImportStats::default();
        DiffImporter::new(&mut sink, BASE).import_instruction_level(
            &primary,
            &secondary,
            &mut stats,
        );
        assert_eq!(sink.comments[&(BASE + 0x1000)], "my own analysis");
        assert_eq!(stats.comments, 0);
    }

    #[test]
    fn only_auto_generated_callees_are_renamed() {
        let mut src = ins(0x1000, "call", "call sub_2000");
        src.symbol_name = Some("parse_config".to_string());
        src.symbol_type = Some("int parse_config(char *)".to_string());
        let secondary = record(0x1000, vec![src]);
        let primary = record(0x1000, vec![ins(0x1000, "call", "call sub_2000")]);

        let mut sink = MockSink::default();
        sink.code_refs.insert(BASE + 0x1000, vec![BASE + 0x2000]);
        sink.names
            .insert(BASE + 0x2000, "sub_402000".to_string());
        let mut stats = ImportStats::default();
        DiffImporter::new(&mut sink, BASE).import_instruction_level(
            &primary,
            &secondary,
            &mut stats,
        );
        assert_eq!(sink.names[&(BASE + 0x2000)], "parse_config");
        // The rename made the callee ours, so the type lands too.
        assert_eq!(sink.types[&(BASE + 0x2000)], "int parse_config(char *)");

        // A user-chosen name stays put.
        sink.names.insert(BASE + 0x2000, "my_parser".to_string());
        DiffImporter::new(&mut sink, BASE).import_instruction_level(
            &primary,
            &secondary,
            &mut stats,
        );
        assert_eq!(sink.names[&(BASE + 0x2000)], "my_parser");
    }

    #[test]
    fn data_ref_rename_redirects_offset_operands() {
        let mut src = ins(0x1000, "mov", "mov eax, offset unk_5000");
        src.symbol_name = Some("g_config".to_string());
        let secondary = record(0x1000, vec![src]);
        let primary = record(0x1000, vec![ins(0x1000, "mov", "mov eax, offset unk_5000")]);

        let mut sink = MockSink::default();
        sink.data_refs.insert(BASE + 0x1000, vec![BASE + 0x5000]);
        sink.offset_bases.insert(BASE + 0x5000, BASE + 0x5008);
        let mut stats = ImportStats::default();
        DiffImporter::new(&mut sink, BASE).import_instruction_level(
            &primary,
            &secondary,
            &mut stats,
        );
        assert_eq!(sink.names[&(BASE + 0x5008)], "g_config");
        assert!(!sink.names.contains_key(&(BASE + 0x5000)));
    }

    #[test]
    fn changed_lines_align_through_the_diff() {
        // Secondary has one extra instruction; annotations after the
        // insertion still land on the right primary addresses.
        let primary = record(
            0x1000,
            vec![
                ins(0x1000, "push", "push ebp"),
                ins(0x1001, "call", "call sub_9000"),
            ],
        );
        let mut annotated = ins(0x1005, "call", "call sub_9000");
        annotated.comment = Some("tail call".to_string());
        let secondary = record(
            0x1000,
            vec![
                ins(0x1000, "push", "push ebp"),
                ins(0x1004, "xor", "xor eax, eax"),
                annotated,
            ],
        );

        let mut sink = MockSink::default();
        let mut stats = ImportStats::default();
        DiffImporter::new(&mut sink, BASE).import_instruction_level(
            &primary,
            &secondary,
            &mut stats,
        );
        assert_eq!(
            sink.comments.get(&(BASE + 0x1001)).map(String::as_str),
            Some("tail call")
        );
    }

    #[test]
    fn function_level_import_guards_placeholders() {
        let primary = record(0x1000, vec![ins(0x1000, "ret", "ret")]);
        let mut secondary = record(0x1000, vec![ins(0x1000, "ret", "ret")]);
        secondary.mangled_name = "sub_401000".to_string();
        secondary.prototype = Some("int()".to_string());
        secondary.comment = Some("does nothing".to_string());
        secondary.function_flags = 0x40;

        let mut sink = MockSink::default();
        let stats = DiffImporter::new(&mut sink, BASE).import_function(&primary, &secondary);

        // Placeholder name and placeholder prototype are both skipped.
        assert!(!sink.names.contains_key(&(BASE + 0x1000)));
        assert!(!sink.types.contains_key(&(BASE + 0x1000)));
        assert_eq!(stats.names, 0);
        assert_eq!(sink.function_comments[&(BASE + 0x1000)], "does nothing");
        assert_eq!(sink.function_flags[&(BASE + 0x1000)], 0x40);
    }

    #[test]
    fn function_rename_retries_with_suffix() {
        let primary = record(0x1000, vec![ins(0x1000, "ret", "ret")]);
        let mut secondary = record(0x1000, vec![ins(0x1000, "ret", "ret")]);
        secondary.mangled_name = "checksum".to_string();

        let mut sink = MockSink::default();
        sink.rejected_names = vec!["checksum".to_string(), "checksum_0".to_string()];
        let stats = DiffImporter::new(&mut sink, BASE).import_function(&primary, &secondary);
        assert_eq!(sink.names[&(BASE + 0x1000)], "checksum_1");
        assert_eq!(stats.names, 1);
    }

    #[test]
    fn import_is_idempotent() {
        let primary = record(0x1000, vec![ins(0x1000, "call", "call helper")]);
        let mut src = ins(0x1000, "call", "call helper");
        src.comment = Some("checked".to_string());
        let secondary = record(0x1000, vec![src]);

        let mut sink = MockSink::default();
        let mut stats = ImportStats::default();
        let mut importer = DiffImporter::new(&mut sink, BASE);
        importer.import_instruction_level(&primary, &secondary, &mut stats);
        assert_eq!(stats.comments, 1);

        let mut second = ImportStats::default();
        importer.import_instruction_level(&primary, &secondary, &mut second);
        assert_eq!(second.comments, 0);
        assert_eq!(sink.comments.len(), 1);
    }
}
