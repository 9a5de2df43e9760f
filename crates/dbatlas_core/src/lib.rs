mod binding;
mod catalog;
mod charset;
mod config;
mod connection_manager;
mod error;
mod error_formatter;
mod fields;
mod handle;
mod introspect;
mod locks;
mod metadata_cache;
mod params;
mod provision;
mod row;
mod schema;
mod schema_builder;
mod value;

pub use binding::{
    BoundParams, BoundStatement, NamedParams, PlaceholderStyle, bind_named, placeholder_names,
    sql_preview,
};
pub use catalog::{DdlDef, DialectCatalog, IntrospectionQueries, MetadataQueries, QueryDef};
pub use charset::{CharsetDecoder, CharsetHandle, decode};
pub use config::{AtlasConfig, AtlasConfigStore, ManagerSettings};
pub use connection_manager::{ConnectionEntry, ConnectionManager, ConnectionSummary};
pub use error::DbError;
pub use error_formatter::{ErrorLocation, FormattedError, mask_host};
pub use fields::FieldAliases;
pub use handle::{DbDriver, PoolSettings, PooledHandle};
pub use introspect::{extract_schema, run_catalog_query};
pub use metadata_cache::{
    CacheState, CodeAlias, CodeTable, ColumnCodeMapping, GlossaryAlias, GlossaryContext,
    GlossaryTerm, MetadataCache, MetadataRecord, NamingConvention, PatternKeyword,
    PatternParameter, QueryPattern, TableRelationship, load_metadata_cache,
};
pub use params::{ConnectionId, ConnectionParams, Dialect, IdentifierCase};
pub use provision::provision_metadata_schema;
pub use row::{ColumnMeta, CursorScope, RawResult, RawRow, RowCursor, normalize};
pub use schema::{
    ColumnInfo, ColumnReference, ConstraintInfo, ConstraintKind, IndexInfo, RecentQuery,
    SchemaInfo, SkippedTable, TableInfo,
};
pub use schema_builder::{ConstraintBuilder, ForeignKeyBuilder, IndexBuilder};
pub use value::Value;

pub use secrecy::{ExposeSecret, SecretString};
