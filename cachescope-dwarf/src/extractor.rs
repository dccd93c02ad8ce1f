//! Debug-info walk: compilation units to the static model
//!
//! One pass over the target's compilation units produces the struct
//! registry, the stack-variable list, the global list and the static
//! range table. A failure inside a single unit skips that unit and is
//! counted; only failing to open or parse the file itself is fatal.

use crate::ranges::StaticRangeTable;
use crate::type_resolver::{attr_udata, die_name, TypeResolver};
use crate::types::{
    GlobalVariable, StackVariable, StructRegistry, TypeArena, TypeId, TypeKind,
};
use anyhow::Context;
use gimli::{EndianSlice, LittleEndian};
use memmap2::Mmap;
use object::{Object, ObjectSection};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

type Slice<'a> = EndianSlice<'a, LittleEndian>;

/// Per-run extraction counters, surfaced in verbose output.
#[derive(Debug, Default, Clone)]
pub struct ExtractStats {
    pub units_total: u64,
    pub units_skipped: u64,
    pub locations_skipped: u64,
}

/// The static model: everything the analyzer knows about the target
/// before it runs.
#[derive(Debug, Default)]
pub struct DebugModel {
    pub arena: TypeArena,
    pub registry: StructRegistry,
    pub stack_variables: Vec<StackVariable>,
    pub globals: Vec<GlobalVariable>,
    pub static_ranges: StaticRangeTable,
    pub stats: ExtractStats,
    by_function: HashMap<String, Vec<usize>>,
}

impl DebugModel {
    /// Whether the target carried any debug info at all.
    pub fn has_debug_info(&self) -> bool {
        self.stats.units_total > 0
    }

    /// Stack variables of `function`, in declaration order.
    pub fn stack_variables_of(&self, function: &str) -> impl Iterator<Item = &StackVariable> {
        self.by_function
            .get(function)
            .into_iter()
            .flatten()
            .map(|&i| &self.stack_variables[i])
    }

    /// Rebuild the derived lookup structures from the flat lists.
    ///
    /// Called once after extraction; also the hook for constructing
    /// synthetic models by hand.
    pub fn rebuild_indexes(&mut self) {
        self.static_ranges = StaticRangeTable::from_globals(&self.globals);
        self.by_function.clear();
        for (i, var) in self.stack_variables.iter().enumerate() {
            self.by_function
                .entry(var.function.clone())
                .or_default()
                .push(i);
        }
    }
}

fn load_dwarf<'a>(
    object: &object::File<'a>,
) -> Result<gimli::Dwarf<Slice<'a>>, gimli::Error> {
    gimli::Dwarf::load(|id| {
        let data = object
            .section_by_name(id.name())
            .and_then(|s| s.data().ok())
            .unwrap_or(&[]);
        Ok(EndianSlice::new(data, LittleEndian))
    })
}

/// Walks an ELF file's debug info and builds the [`DebugModel`].
pub struct Extractor {
    resolver: TypeResolver,
    model: DebugModel,
}

impl Extractor {
    /// Extract the static model from the binary at `path`.
    ///
    /// Missing debug info yields an empty model (the caller decides how
    /// hard to fail); a malformed file is an error.
    pub fn extract(path: &Path) -> anyhow::Result<DebugModel> {
        let file = File::open(path)
            .with_context(|| format!("failed to open binary {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map binary {}", path.display()))?;
        let object = object::File::parse(&*mmap)
            .with_context(|| format!("failed to parse ELF {}", path.display()))?;
        let dwarf = load_dwarf(&object)?;

        let mut extractor = Extractor {
            resolver: TypeResolver::new(),
            model: DebugModel::default(),
        };
        extractor.walk_units(&dwarf);

        let mut model = extractor.model;
        model.rebuild_indexes();

        if !model.has_debug_info() {
            warn!("no debug info found in {}", path.display());
        } else {
            info!(
                "extracted {} types, {} structs, {} stack variables, {} globals ({} units, {} skipped)",
                model.arena.len(),
                model.registry.len(),
                model.stack_variables.len(),
                model.globals.len(),
                model.stats.units_total,
                model.stats.units_skipped,
            );
        }
        Ok(model)
    }

    fn walk_units(&mut self, dwarf: &gimli::Dwarf<Slice<'_>>) {
        let mut units = dwarf.units();
        loop {
            let header = match units.next() {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) => {
                    debug!("unit header iteration failed: {}", e);
                    self.model.stats.units_skipped += 1;
                    break;
                }
            };
            self.model.stats.units_total += 1;
            let unit = match dwarf.unit(header) {
                Ok(u) => u,
                Err(e) => {
                    debug!("skipping malformed unit: {}", e);
                    self.model.stats.units_skipped += 1;
                    continue;
                }
            };
            if let Err(e) = self.walk_unit(dwarf, &unit) {
                debug!("skipping unit after walk error: {}", e);
                self.model.stats.units_skipped += 1;
            }
        }
    }

    fn walk_unit(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> gimli::Result<()> {
        let mut tree = unit.entries_tree(None)?;
        let root = tree.root()?;
        self.walk_die(root, dwarf, unit)
    }

    fn walk_die(
        &mut self,
        node: gimli::EntriesTreeNode<Slice<'_>>,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> gimli::Result<()> {
        let entry = node.entry();
        match entry.tag() {
            gimli::DW_TAG_structure_type
            | gimli::DW_TAG_class_type
            | gimli::DW_TAG_union_type => {
                let offset = entry.offset();
                if let Some(id) =
                    self.resolver
                        .resolve(dwarf, unit, offset, 0, &mut self.model.arena)
                {
                    self.register_record(id);
                }
                // Recurse anyway: nested record definitions live below.
                let mut children = node.children();
                while let Some(child) = children.next()? {
                    self.walk_die(child, dwarf, unit)?;
                }
            }
            gimli::DW_TAG_subprogram => {
                self.process_subprogram(node, dwarf, unit)?;
            }
            gimli::DW_TAG_variable => {
                self.process_global(entry, dwarf, unit);
            }
            _ => {
                let mut children = node.children();
                while let Some(child) = children.next()? {
                    self.walk_die(child, dwarf, unit)?;
                }
            }
        }
        Ok(())
    }

    fn register_record(&mut self, id: TypeId) {
        let (name, kind, has_name) = match self.model.arena.get(id) {
            Some(t) => (t.name.clone(), t.kind, !t.name.is_empty()),
            None => return,
        };
        if has_name && matches!(kind, TypeKind::Struct | TypeKind::Class | TypeKind::Union) {
            self.model.registry.register(&name, id, &self.model.arena);
        }
    }

    fn process_subprogram(
        &mut self,
        node: gimli::EntriesTreeNode<Slice<'_>>,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> gimli::Result<()> {
        let entry = node.entry();
        let function = match die_name(dwarf, unit, entry).or_else(|| {
            entry
                .attr_value(gimli::DW_AT_linkage_name)
                .ok()
                .flatten()
                .and_then(|v| dwarf.attr_string(unit, v).ok())
                .map(|s| s.to_string_lossy().into_owned())
        }) {
            Some(name) => name,
            // Anonymous subprograms cannot anchor attribution; skip.
            None => return Ok(()),
        };

        self.collect_frame_variables(node, dwarf, unit, &function)
    }

    /// Collect `variable`/`formal_parameter` DIEs below a subprogram,
    /// descending through lexical blocks but not nested subprograms.
    fn collect_frame_variables(
        &mut self,
        node: gimli::EntriesTreeNode<Slice<'_>>,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        function: &str,
    ) -> gimli::Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            match entry.tag() {
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
                    self.process_stack_variable(entry, dwarf, unit, function);
                }
                gimli::DW_TAG_lexical_block | gimli::DW_TAG_inlined_subroutine => {
                    self.collect_frame_variables(child, dwarf, unit, function)?;
                }
                gimli::DW_TAG_subprogram => {
                    // Nested function: its frame is not ours.
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn process_stack_variable(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        function: &str,
    ) {
        // Inlined instances park name, type and sometimes the location
        // on the abstract origin; follow the reference one hop and apply
        // the same single-op rule there.
        let origin = entry
            .attr_value(gimli::DW_AT_abstract_origin)
            .ok()
            .flatten()
            .and_then(|v| match v {
                gimli::AttributeValue::UnitRef(off) => unit.entry(off).ok(),
                _ => None,
            });
        let name_entry = origin.as_ref().unwrap_or(entry);

        let frame_offset = match self
            .single_op_fbreg(entry, unit)
            .or_else(|| origin.as_ref().and_then(|o| self.single_op_fbreg(o, unit)))
        {
            Some(off) => off,
            None => {
                self.model.stats.locations_skipped += 1;
                return;
            }
        };

        let name = match die_name(dwarf, unit, name_entry) {
            Some(n) => n,
            None => return,
        };

        let type_id = self.entry_type(name_entry, dwarf, unit);
        let size = self.size_of(type_id);

        self.model.stack_variables.push(StackVariable {
            function: function.to_string(),
            name,
            size,
            frame_offset,
            type_id,
        });
    }

    fn process_global(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) {
        let address = match self.single_op_addr(entry, unit) {
            Some(addr) => addr,
            None => return,
        };
        let name = match die_name(dwarf, unit, entry) {
            Some(n) => n,
            None => return,
        };

        let type_id = self.entry_type(entry, dwarf, unit);
        let size = self
            .size_of(type_id)
            .max(attr_udata(entry, gimli::DW_AT_byte_size).unwrap_or(0));

        self.model.globals.push(GlobalVariable {
            name,
            address,
            size,
            type_id,
        });
    }

    fn entry_type(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> Option<TypeId> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(off) => {
                self.resolver
                    .resolve(dwarf, unit, off, 0, &mut self.model.arena)
            }
            _ => None,
        }
    }

    fn size_of(&self, type_id: Option<TypeId>) -> u64 {
        type_id
            .and_then(|id| self.model.arena.strip(id))
            .and_then(|id| self.model.arena.get(id))
            .map(|t| t.size)
            .unwrap_or(0)
    }

    /// Accept only the single-operation location form `fbreg(offset)`.
    ///
    /// List-based location descriptions and multi-op expressions are
    /// skipped; samples landing in such variables simply go unattributed.
    fn single_op_fbreg(
        &self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> Option<i64> {
        let expr = match entry.attr_value(gimli::DW_AT_location).ok()?? {
            gimli::AttributeValue::Exprloc(expr) => expr,
            _ => return None,
        };
        let mut ops = expr.operations(unit.encoding());
        let first = ops.next().ok()??;
        if ops.next().ok()?.is_some() {
            return None;
        }
        match first {
            gimli::Operation::FrameOffset { offset } => Some(offset),
            _ => None,
        }
    }

    /// Accept only the single-operation location form `addr(vma)`.
    fn single_op_addr(
        &self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
    ) -> Option<u64> {
        let expr = match entry.attr_value(gimli::DW_AT_location).ok()?? {
            gimli::AttributeValue::Exprloc(expr) => expr,
            _ => return None,
        };
        let mut ops = expr.operations(unit.encoding());
        let first = ops.next().ok()??;
        if ops.next().ok()?.is_some() {
            return None;
        }
        match first {
            gimli::Operation::Address { address } if address != 0 => Some(address),
            _ => None,
        }
    }
}
