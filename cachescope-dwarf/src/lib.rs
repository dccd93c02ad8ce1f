//! CacheScope DWARF extraction library
//!
//! Builds the static model of a target binary from its debug info: struct
//! layouts, stack variables with frame-base offsets, globals with
//! link-time addresses, and a containment-queryable interval table over
//! the globals.

pub mod extractor;
pub mod ranges;
pub(crate) mod type_resolver;
pub mod types;

pub use extractor::{DebugModel, ExtractStats, Extractor};
pub use ranges::{StaticRange, StaticRangeTable};
pub use types::{
    FieldInfo, GlobalVariable, StackVariable, StructRegistry, TypeArena, TypeId, TypeInfo,
    TypeKind,
};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum DwarfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DWARF parsing error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("Object file error: {0}")]
    Object(#[from] object::Error),
    #[error("no debug info in {0}")]
    MissingDebugInfo(std::path::PathBuf),
}

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_node_struct() -> (TypeArena, TypeId) {
        // Models `struct Node { int x; Node* next; }` on x86-64:
        // int at 0, pointer at alignment-rounded offset 8, total 16.
        let mut arena = TypeArena::new();
        let int_id = TypeId(1);
        let node_id = TypeId(2);
        let ptr_id = TypeId(3);

        arena.insert(
            int_id,
            TypeInfo {
                name: "int".to_string(),
                kind: TypeKind::Primitive,
                size: 4,
                align: 4,
                pointee: None,
                element: None,
                array_len: 0,
                bases: Vec::new(),
                fields: Vec::new(),
                is_declaration: false,
            },
        );
        arena.insert(
            ptr_id,
            TypeInfo {
                name: "Node*".to_string(),
                kind: TypeKind::Pointer,
                size: 8,
                align: 8,
                pointee: Some(node_id),
                element: None,
                array_len: 0,
                bases: Vec::new(),
                fields: Vec::new(),
                is_declaration: false,
            },
        );
        arena.insert(
            node_id,
            TypeInfo {
                name: "Node".to_string(),
                kind: TypeKind::Struct,
                size: 16,
                align: 8,
                pointee: None,
                element: None,
                array_len: 0,
                bases: Vec::new(),
                fields: vec![
                    FieldInfo {
                        name: "x".to_string(),
                        offset: 0,
                        size: 4,
                        type_id: Some(int_id),
                        ..Default::default()
                    },
                    FieldInfo {
                        name: "next".to_string(),
                        offset: 8,
                        size: 8,
                        type_id: Some(ptr_id),
                        ..Default::default()
                    },
                ],
                is_declaration: false,
            },
        );
        (arena, node_id)
    }

    #[test]
    fn self_referential_struct_layout() {
        let (arena, node_id) = arena_with_node_struct();
        let mut registry = StructRegistry::new();
        registry.register("Node", node_id, &arena);

        let node = registry.lookup("Node", &arena).unwrap();
        assert_eq!(node.size, 16);
        assert_eq!(node.fields.len(), 2);
        assert_eq!(node.fields[0].offset, 0);
        assert_eq!(node.fields[1].offset, 8);
    }

    #[test]
    fn field_containment_invariant() {
        let (arena, node_id) = arena_with_node_struct();
        let node = arena.get(node_id).unwrap();
        for field in &node.fields {
            if field.bit_size == 0 {
                assert!(field.offset + field.size <= node.size);
            }
        }
    }

    #[test]
    fn stripped_type_graph_is_acyclic() {
        // Walking field types with transparent stripping must never
        // revisit the start node except through a pointer edge.
        let (arena, node_id) = arena_with_node_struct();
        let node = arena.get(node_id).unwrap();
        for field in &node.fields {
            let stripped = field.type_id.and_then(|id| arena.strip(id)).unwrap();
            if stripped == node_id {
                panic!("field {} strips back to its container", field.name);
            }
            // A pointer's pointee may close the cycle; that is allowed.
            if let Some(t) = arena.get(stripped) {
                if t.kind == TypeKind::Pointer {
                    assert_eq!(t.pointee, Some(node_id));
                }
            }
        }
    }
}
