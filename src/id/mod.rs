pub mod generator;
pub mod identifier;
pub mod mapper;
pub mod optimizer;
pub mod structure;

pub use generator::{IdentifierGenerator, SequenceStyleGenerator};
pub use identifier::{CollectionKey, EntityKey, FlatMap, Identifier};
pub use mapper::{IdComponent, IdProperty, IdentifierMapper, QueryParameterData};
pub use optimizer::{AccessCallback, Optimizer, OptimizerDescriptor};
pub use structure::{DatabaseStructure, SequenceStructure, TableStructure};
