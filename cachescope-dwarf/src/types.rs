//! Type graph storage
//!
//! All type and field records extracted from debug info live in a single
//! [`TypeArena`] keyed by the DIE's global debug-info offset. Cross
//! references between types are [`TypeId`] keys, never owning references,
//! so self-referential structs (`struct Node { Node* next; }`) are
//! representable without cycles in the ownership graph.

use std::collections::HashMap;

/// Identity of a type: its DIE offset within `.debug_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Primitive,
    Pointer,
    Array,
    Struct,
    Class,
    Union,
    Enum,
    Typedef,
    Function,
    Const,
    Volatile,
    Reference,
    Unknown,
}

/// One member of a struct, class, or union.
#[derive(Debug, Clone, Default)]
pub struct FieldInfo {
    pub name: String,
    /// Byte offset from the start of the containing struct.
    pub offset: u64,
    pub size: u64,
    /// Nonzero only for bitfields.
    pub bit_size: u64,
    pub bit_offset: u64,
    pub type_id: Option<TypeId>,
}

/// One node of the type graph.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: String,
    pub kind: TypeKind,
    pub size: u64,
    pub align: u64,
    /// Pointee for pointers/references, underlying type for
    /// typedef/const/volatile chains.
    pub pointee: Option<TypeId>,
    /// Element type for arrays.
    pub element: Option<TypeId>,
    /// Element count for arrays; 0 means incomplete.
    pub array_len: u64,
    /// Base classes, in declaration order.
    pub bases: Vec<TypeId>,
    /// Members, in declaration order.
    pub fields: Vec<FieldInfo>,
    /// Declaration-only struct/class; no layout available.
    pub is_declaration: bool,
}

impl TypeInfo {
    pub fn unknown(name: impl Into<String>) -> Self {
        TypeInfo {
            name: name.into(),
            kind: TypeKind::Unknown,
            size: 0,
            align: 0,
            pointee: None,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        }
    }
}

/// Single-owner storage for all extracted types.
///
/// Insert-once: the extractor fills the arena during the compilation-unit
/// scan, after which it is read-only for the life of the analysis.
#[derive(Debug, Default)]
pub struct TypeArena {
    types: HashMap<TypeId, TypeInfo>,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeInfo> {
        self.types.get(&id)
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.types.contains_key(&id)
    }

    pub fn insert(&mut self, id: TypeId, ty: TypeInfo) {
        self.types.insert(id, ty);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TypeId, &TypeInfo)> {
        self.types.iter()
    }

    /// Follow typedef/qualifier/reference chains to the underlying type.
    ///
    /// Pointer edges are deliberately NOT followed: stripping stops at
    /// them, which is what keeps the stripped graph acyclic.
    pub fn strip(&self, id: TypeId) -> Option<TypeId> {
        let mut cur = id;
        // Chains are short in practice; the bound guards malformed input.
        for _ in 0..32 {
            let ty = self.types.get(&cur)?;
            match ty.kind {
                TypeKind::Typedef
                | TypeKind::Const
                | TypeKind::Volatile
                | TypeKind::Reference => match ty.pointee {
                    Some(next) => cur = next,
                    None => return Some(cur),
                },
                _ => return Some(cur),
            }
        }
        Some(cur)
    }

    /// Display name of a type, `"<unknown>"` when absent.
    pub fn name_of(&self, id: Option<TypeId>) -> &str {
        id.and_then(|id| self.types.get(&id))
            .map(|t| t.name.as_str())
            .unwrap_or("<unknown>")
    }
}

/// Name-keyed view of struct and class layouts.
///
/// Insert-once then read-only; the first definition of a name wins so
/// later declaration-only stubs cannot clobber a full layout.
#[derive(Debug, Default)]
pub struct StructRegistry {
    by_name: HashMap<String, TypeId>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, id: TypeId, arena: &TypeArena) {
        if name.is_empty() {
            return;
        }
        match self.by_name.get(name) {
            // Replace a stub with a definition, never the other way around.
            Some(existing) => {
                let have_fields = arena
                    .get(*existing)
                    .map(|t| !t.fields.is_empty())
                    .unwrap_or(false);
                let new_has_fields = arena
                    .get(id)
                    .map(|t| !t.fields.is_empty())
                    .unwrap_or(false);
                if !have_fields && new_has_fields {
                    self.by_name.insert(name.to_string(), id);
                }
            }
            None => {
                self.by_name.insert(name.to_string(), id);
            }
        }
    }

    pub fn lookup<'a>(&self, name: &str, arena: &'a TypeArena) -> Option<&'a TypeInfo> {
        self.by_name.get(name).and_then(|id| arena.get(*id))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|s| s.as_str())
    }
}

/// A variable that lives in a function's frame.
///
/// `frame_offset` is the signed operand of the `DW_OP_fbreg` location;
/// the runtime address is `CFA + frame_offset`.
#[derive(Debug, Clone)]
pub struct StackVariable {
    pub function: String,
    pub name: String,
    pub size: u64,
    pub frame_offset: i64,
    pub type_id: Option<TypeId>,
}

/// A variable with a link-time address.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub type_id: Option<TypeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: TypeKind, name: &str, pointee: Option<TypeId>) -> TypeInfo {
        TypeInfo {
            name: name.to_string(),
            kind,
            size: 8,
            align: 8,
            pointee,
            element: None,
            array_len: 0,
            bases: Vec::new(),
            fields: Vec::new(),
            is_declaration: false,
        }
    }

    #[test]
    fn strip_unwraps_typedef_and_qualifiers() {
        let mut arena = TypeArena::new();
        arena.insert(TypeId(1), node(TypeKind::Primitive, "int", None));
        arena.insert(TypeId(2), node(TypeKind::Const, "const int", Some(TypeId(1))));
        arena.insert(TypeId(3), node(TypeKind::Typedef, "my_int", Some(TypeId(2))));
        assert_eq!(arena.strip(TypeId(3)), Some(TypeId(1)));
    }

    #[test]
    fn strip_stops_at_pointers() {
        // struct Node { Node* next; } — the pointer edge closes a cycle,
        // stripping must not follow it.
        let mut arena = TypeArena::new();
        let mut s = node(TypeKind::Struct, "Node", None);
        s.fields.push(FieldInfo {
            name: "next".to_string(),
            offset: 8,
            size: 8,
            type_id: Some(TypeId(20)),
            ..Default::default()
        });
        arena.insert(TypeId(10), s);
        arena.insert(TypeId(20), node(TypeKind::Pointer, "Node*", Some(TypeId(10))));
        assert_eq!(arena.strip(TypeId(20)), Some(TypeId(20)));
    }

    #[test]
    fn registry_prefers_definitions_over_stubs() {
        let mut arena = TypeArena::new();
        let stub = node(TypeKind::Struct, "S", None);
        let mut def = node(TypeKind::Struct, "S", None);
        def.fields.push(FieldInfo {
            name: "x".to_string(),
            size: 4,
            ..Default::default()
        });
        arena.insert(TypeId(1), stub);
        arena.insert(TypeId(2), def);

        let mut reg = StructRegistry::new();
        reg.register("S", TypeId(1), &arena);
        reg.register("S", TypeId(2), &arena);
        assert_eq!(reg.lookup("S", &arena).unwrap().fields.len(), 1);

        // A later stub does not clobber the definition.
        reg.register("S", TypeId(1), &arena);
        assert_eq!(reg.lookup("S", &arena).unwrap().fields.len(), 1);
    }
}
