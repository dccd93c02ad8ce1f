//! Memoized DWARF type resolution
//!
//! Types are resolved on demand into the [`TypeArena`], keyed by the DIE's
//! global debug-info offset. A placeholder is inserted before recursing
//! into a node's children so that cycles through pointers terminate
//! instead of descending forever; recursion is additionally capped at
//! [`MAX_TYPE_DEPTH`], beyond which the placeholder is left as an opaque
//! `Unknown`.

use crate::types::{FieldInfo, TypeArena, TypeId, TypeInfo, TypeKind};
use gimli::{EndianSlice, LittleEndian, UnitOffset};
use std::collections::HashSet;
use tracing::debug;

type Slice<'a> = EndianSlice<'a, LittleEndian>;

/// Cycles through pointers terminate via the placeholder at depth 1; the
/// cap guards degenerate chains in malformed debug info.
const MAX_TYPE_DEPTH: usize = 10;

/// Standard-library internals are recorded as opaque stubs so lookups do
/// not recurse into container guts.
const STD_INTERNAL_PREFIXES: &[&str] = &[
    "std::",
    "__gnu",
    "__cxx",
    "_Rb_tree",
    "_Hashtable",
    "_Vector_base",
    "_Deque_base",
];

pub(crate) fn is_std_internal(name: &str) -> bool {
    STD_INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Compute a type's global identity from its unit-local offset.
pub(crate) fn global_type_id(unit: &gimli::Unit<Slice<'_>>, offset: UnitOffset) -> TypeId {
    let base = unit
        .header
        .offset()
        .as_debug_info_offset()
        .map(|o| o.0 as u64)
        .unwrap_or(0);
    TypeId(base + offset.0 as u64)
}

pub(crate) fn die_name(
    dwarf: &gimli::Dwarf<Slice<'_>>,
    unit: &gimli::Unit<Slice<'_>>,
    entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
) -> Option<String> {
    let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
    dwarf
        .attr_string(unit, attr)
        .ok()
        .map(|s| s.to_string_lossy().into_owned())
}

pub(crate) fn attr_udata(
    entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
    name: gimli::DwAt,
) -> Option<u64> {
    entry.attr_value(name).ok()?.and_then(|v| v.udata_value())
}

/// Resolves type DIEs into the arena, tracking in-flight nodes.
#[derive(Debug, Default)]
pub(crate) struct TypeResolver {
    in_progress: HashSet<TypeId>,
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the type at `offset`, returning its arena id.
    ///
    /// Already-resolved and in-flight ids return immediately; in-flight
    /// ids stand for the placeholder already in the arena.
    pub fn resolve(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        offset: UnitOffset,
        depth: usize,
        arena: &mut TypeArena,
    ) -> Option<TypeId> {
        let id = global_type_id(unit, offset);
        if self.in_progress.contains(&id) {
            return Some(id);
        }
        if arena.contains(id) {
            return Some(id);
        }

        let entry = match unit.entry(offset) {
            Ok(e) => e,
            Err(e) => {
                debug!("failed to read type DIE at {:?}: {}", offset, e);
                return None;
            }
        };

        let name = die_name(dwarf, unit, &entry);

        if depth > MAX_TYPE_DEPTH {
            arena.insert(id, TypeInfo::unknown(name.unwrap_or_default()));
            return Some(id);
        }

        // Placeholder first: anything that reaches back here through a
        // pointer sees this entry instead of recursing.
        self.in_progress.insert(id);
        let mut placeholder = TypeInfo::unknown(name.clone().unwrap_or_default());
        placeholder.size = attr_udata(&entry, gimli::DW_AT_byte_size).unwrap_or(0);
        arena.insert(id, placeholder);

        let resolved = match entry.tag() {
            gimli::DW_TAG_base_type => self.parse_base(&entry, name),
            gimli::DW_TAG_pointer_type => {
                self.parse_indirect(dwarf, unit, &entry, depth, arena, TypeKind::Pointer, "*")
            }
            gimli::DW_TAG_reference_type | gimli::DW_TAG_rvalue_reference_type => {
                self.parse_indirect(dwarf, unit, &entry, depth, arena, TypeKind::Reference, "&")
            }
            gimli::DW_TAG_array_type => self.parse_array(dwarf, unit, &entry, depth, arena),
            gimli::DW_TAG_structure_type => {
                self.parse_record(dwarf, unit, &entry, depth, arena, TypeKind::Struct, name)
            }
            gimli::DW_TAG_class_type => {
                self.parse_record(dwarf, unit, &entry, depth, arena, TypeKind::Class, name)
            }
            gimli::DW_TAG_union_type => {
                self.parse_record(dwarf, unit, &entry, depth, arena, TypeKind::Union, name)
            }
            gimli::DW_TAG_enumeration_type => self.parse_enum(&entry, name),
            gimli::DW_TAG_typedef => {
                self.parse_alias(dwarf, unit, &entry, depth, arena, TypeKind::Typedef, name)
            }
            gimli::DW_TAG_const_type => {
                self.parse_qualified(dwarf, unit, &entry, depth, arena, TypeKind::Const, "const")
            }
            gimli::DW_TAG_volatile_type => self.parse_qualified(
                dwarf,
                unit,
                &entry,
                depth,
                arena,
                TypeKind::Volatile,
                "volatile",
            ),
            // restrict adds nothing to layout; treat as a transparent alias.
            gimli::DW_TAG_restrict_type => {
                self.parse_alias(dwarf, unit, &entry, depth, arena, TypeKind::Typedef, name)
            }
            gimli::DW_TAG_subroutine_type => Some(TypeInfo {
                name: name.unwrap_or_else(|| "<function>".to_string()),
                kind: TypeKind::Function,
                size: 8,
                align: 8,
                pointee: None,
                element: None,
                array_len: 0,
                bases: Vec::new(),
                fields: Vec::new(),
                is_declaration: false,
            }),
            tag => {
                debug!("unsupported type tag {:?}", tag);
                None
            }
        };

        self.in_progress.remove(&id);
        if let Some(info) = resolved {
            arena.insert(id, info);
        }
        // On None the placeholder Unknown stays, which is the degraded
        // result the caller can still name and size.
        Some(id)
    }

    fn parse_base(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        name: Option<String>,
    ) -> Option<TypeInfo> {
        let size = attr_udata(entry, gimli::DW_AT_byte_size).unwrap_or(0);
        Some(TypeInfo {
            name: name.unwrap_or_else(|| format!("unknown_base_{size}")),
            kind: TypeKind::Primitive,
            size,
            align: attr_udata(entry, gimli::DW_AT_alignment).unwrap_or(size),
            pointee: None,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        })
    }

    fn referenced_type(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
    ) -> Option<TypeId> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(off) => {
                self.resolve(dwarf, unit, off, depth + 1, arena)
            }
            _ => None,
        }
    }

    fn parse_indirect(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
        kind: TypeKind,
        suffix: &str,
    ) -> Option<TypeInfo> {
        let pointee = self.referenced_type(dwarf, unit, entry, depth, arena);
        let pointee_name = match pointee {
            Some(id) => arena.name_of(Some(id)).to_string(),
            None => "void".to_string(),
        };
        Some(TypeInfo {
            name: format!("{pointee_name}{suffix}"),
            kind,
            size: attr_udata(entry, gimli::DW_AT_byte_size).unwrap_or(8),
            align: 8,
            pointee,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        })
    }

    fn parse_array(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
    ) -> Option<TypeInfo> {
        let element = self.referenced_type(dwarf, unit, entry, depth, arena);
        let mut count: u64 = 0;

        // Bounds come from DW_TAG_subrange_type children.
        if let Ok(mut tree) = unit.entries_tree(Some(entry.offset())) {
            if let Ok(root) = tree.root() {
                let mut children = root.children();
                while let Ok(Some(child)) = children.next() {
                    let child_entry = child.entry();
                    if child_entry.tag() != gimli::DW_TAG_subrange_type {
                        continue;
                    }
                    if let Some(c) = attr_udata(child_entry, gimli::DW_AT_count) {
                        count = c;
                    } else if let Some(ub) = attr_udata(child_entry, gimli::DW_AT_upper_bound) {
                        let lb = attr_udata(child_entry, gimli::DW_AT_lower_bound).unwrap_or(0);
                        count = ub.saturating_sub(lb) + 1;
                    }
                }
            }
        }

        let (elem_name, elem_size) = match element {
            Some(id) => {
                let stripped = arena.strip(id).unwrap_or(id);
                let size = arena.get(stripped).map(|t| t.size).unwrap_or(0);
                (arena.name_of(Some(id)).to_string(), size)
            }
            None => ("unknown".to_string(), 0),
        };
        let total = attr_udata(entry, gimli::DW_AT_byte_size).unwrap_or(elem_size * count);

        Some(TypeInfo {
            name: if count > 0 {
                format!("{elem_name}[{count}]")
            } else {
                format!("{elem_name}[]")
            },
            kind: TypeKind::Array,
            size: total,
            align: attr_udata(entry, gimli::DW_AT_alignment).unwrap_or(0),
            pointee: None,
            element,
            array_len: count,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        })
    }

    fn parse_record(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
        kind: TypeKind,
        name: Option<String>,
    ) -> Option<TypeInfo> {
        let name = name.unwrap_or_else(|| "<anonymous>".to_string());
        let size = attr_udata(entry, gimli::DW_AT_byte_size).unwrap_or(0);
        let align = attr_udata(entry, gimli::DW_AT_alignment).unwrap_or(0);

        let is_declaration = matches!(
            entry.attr_value(gimli::DW_AT_declaration),
            Ok(Some(gimli::AttributeValue::Flag(true)))
        );

        // Declaration-only and library-internal records stay opaque.
        if is_declaration || is_std_internal(&name) {
            return Some(TypeInfo {
                name,
                kind,
                size,
                align,
                pointee: None,
                element: None,
                array_len: 0,
                bases: Vec::new(),
                fields: Vec::new(),
                is_declaration: true,
            });
        }

        let mut bases = Vec::new();
        let mut fields = Vec::new();

        if let Ok(mut tree) = unit.entries_tree(Some(entry.offset())) {
            if let Ok(root) = tree.root() {
                let mut children = root.children();
                while let Ok(Some(child)) = children.next() {
                    let child_entry = child.entry();
                    match child_entry.tag() {
                        gimli::DW_TAG_member => {
                            fields.push(self.parse_member(
                                dwarf,
                                unit,
                                child_entry,
                                depth,
                                arena,
                            ));
                        }
                        gimli::DW_TAG_inheritance => {
                            if let Some(base_id) =
                                self.referenced_type(dwarf, unit, child_entry, depth, arena)
                            {
                                bases.push(base_id);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        Some(TypeInfo {
            name,
            kind,
            size,
            align,
            pointee: None,
            element: None,
            array_len: 0,
            bases,
            fields,
            is_declaration: false,
        })
    }

    fn parse_member(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
    ) -> FieldInfo {
        let type_id = self.referenced_type(dwarf, unit, entry, depth, arena);
        let size = type_id
            .and_then(|id| arena.strip(id))
            .and_then(|id| arena.get(id))
            .map(|t| t.size)
            .unwrap_or(0);

        FieldInfo {
            name: die_name(dwarf, unit, entry).unwrap_or_default(),
            offset: attr_udata(entry, gimli::DW_AT_data_member_location).unwrap_or(0),
            size,
            bit_size: attr_udata(entry, gimli::DW_AT_bit_size).unwrap_or(0),
            bit_offset: attr_udata(entry, gimli::DW_AT_bit_offset)
                .or_else(|| attr_udata(entry, gimli::DW_AT_data_bit_offset))
                .unwrap_or(0),
            type_id,
        }
    }

    fn parse_enum(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        name: Option<String>,
    ) -> Option<TypeInfo> {
        let size = attr_udata(entry, gimli::DW_AT_byte_size).unwrap_or(4);
        Some(TypeInfo {
            name: name.unwrap_or_else(|| "<anonymous enum>".to_string()),
            kind: TypeKind::Enum,
            size,
            align: attr_udata(entry, gimli::DW_AT_alignment).unwrap_or(size),
            pointee: None,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        })
    }

    fn parse_alias(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
        kind: TypeKind,
        name: Option<String>,
    ) -> Option<TypeInfo> {
        let underlying = self.referenced_type(dwarf, unit, entry, depth, arena);
        let size = underlying
            .and_then(|id| arena.strip(id))
            .and_then(|id| arena.get(id))
            .map(|t| t.size)
            .unwrap_or(0);
        Some(TypeInfo {
            name: name.unwrap_or_else(|| arena.name_of(underlying).to_string()),
            kind,
            size,
            align: 0,
            pointee: underlying,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        })
    }

    fn parse_qualified(
        &mut self,
        dwarf: &gimli::Dwarf<Slice<'_>>,
        unit: &gimli::Unit<Slice<'_>>,
        entry: &gimli::DebuggingInformationEntry<Slice<'_>>,
        depth: usize,
        arena: &mut TypeArena,
        kind: TypeKind,
        prefix: &str,
    ) -> Option<TypeInfo> {
        let underlying = self.referenced_type(dwarf, unit, entry, depth, arena);
        let inner_name = arena.name_of(underlying).to_string();
        let size = underlying
            .and_then(|id| arena.strip(id))
            .and_then(|id| arena.get(id))
            .map(|t| t.size)
            .unwrap_or(0);
        Some(TypeInfo {
            name: format!("{prefix} {inner_name}"),
            kind,
            size,
            align: 0,
            pointee: underlying,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        })
    }
}
