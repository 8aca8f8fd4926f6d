// ============================================================================
// ormkit Library
// ============================================================================

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod id;
pub mod jdbc;
pub mod loadplan;
pub mod metadata;
pub mod persister;
pub mod result;
pub mod sql;
pub mod transaction;

// Re-export main types for convenience
pub use config::{FlushMode, Settings};
pub use core::{OrmError, Result, SqlType, Value};
pub use engine::{EntityHandle, Restriction, SelectionQuery, Session, SessionFactory, SessionFactoryBuilder};
pub use id::Identifier;
pub use jdbc::MemoryDatabase;
pub use metadata::MappingModel;
