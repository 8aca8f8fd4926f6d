// ============================================================================
// Engine: sessions, the persistence context and the unit of work
// ============================================================================

mod action;
mod batch;
mod cascade;
mod context;
mod entity;
mod factory;
mod flush;
mod loader;
mod query;
mod session;
mod statistics;

pub use context::EntityStatus;
pub use entity::{AttributeValue, CollectionHandle, Element, EntityHandle, StateValue, WeakEntityHandle};
pub use factory::{LoadTarget, PreparedLoad, SessionFactory, SessionFactoryBuilder};
pub use query::{Restriction, SelectionQuery};
pub use session::Session;
pub use statistics::Statistics;
