pub mod error;
pub mod types;
pub mod value;

pub use error::{OrmError, Result};
pub use types::{Column, Row, SqlType};
pub use value::Value;
