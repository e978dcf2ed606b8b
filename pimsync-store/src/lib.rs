mod client;
mod escape;
mod item;
mod statements;

pub use client::{ErrorDomain, HttpStoreClient, ResultRow, StoreClient, StoreError};
pub use escape::{escape_iri_component, escape_literal};
pub use item::{ItemError, ItemKind, LocalItem, RemoteRecord};
pub use statements::{
    DATASOURCE_URN, StatementError, build_delete, build_insert, declare_data_source,
    format_datetime, item_iri, parse_datetime, snapshot_query,
};
