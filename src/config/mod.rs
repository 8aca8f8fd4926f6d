pub mod settings;

pub use settings::{FlushMode, SequenceMismatchStrategy, Settings};
