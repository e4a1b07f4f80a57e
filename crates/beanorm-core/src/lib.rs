//! Core types and collaborator boundaries for the beanorm persistence engine.
//!
//! This crate provides the foundational abstractions shared by the query plan
//! and session layers:
//!
//! - `Value` — dynamically-typed SQL value used for binding and row reading
//! - `Row` / `ColumnInfo` — flat result cursor rows with shared column metadata
//! - `Error` — the typed failure taxonomy (mapping / execution / consistency / batch)
//! - `BeanDescriptor` / `MappingRegistry` — externally-resolved bean metadata
//! - `Bean` / `BeanCollection` — dynamic bean instances and shared collections
//! - `Connection` / `Statement` / `RowCursor` — the transaction-provider boundary

pub mod bean;
pub mod connection;
pub mod descriptor;
pub mod error;
pub mod row;
pub mod value;

pub use bean::{Bean, BeanCollection, BeanRef};
pub use connection::{
    CacheInvalidation, CancelHandle, Connection, NoopInvalidation, PassthroughConvert, RowCursor,
    ScalarConvert, Statement,
};
pub use descriptor::{
    AssocKind, AssocMeta, BeanDescriptor, Discriminator, JoinPair, LinkTable, MappingRegistry,
    PropertyMeta,
};
pub use error::{
    BatchError, ConsistencyError, Error, ExecutionError, ExecutionErrorKind, MappingError, Result,
    TypeError, redacted_bind_log,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::{Value, hash_value, hash_values};
