//! Catalog mirror: committed snapshot plus the uncommitted DDL overlay.

mod cache;

pub use cache::{
    ColumnType, SchemaCache, SchemaColumn, SchemaDelta, SchemaObject, SchemaPartition,
    SchemaUser, TableDef, TableMatch,
};
