//! Schema definition layer — type-string parsing, the dependency graph,
//! and structural diffing.

mod parser;
mod graph;
mod diff;

pub use parser::{
    parse_schema, parse_field, Schema, SchemaSource, EntitySchema, FieldSpec,
    FieldType, Primitive, RefOperator, MatchMode, RefDirection, IndexKind,
};
pub use graph::{DependencyGraph, DependencyNode, DependencyEdge};
pub use diff::{
    diff_schemas, SchemaDiff, EntityDiff, FieldChange, ChangeKind, RenameCandidate,
};
