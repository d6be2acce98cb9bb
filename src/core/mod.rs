pub mod error;
pub mod types;

pub use error::{Result, SheetError};
pub use types::{CharacterKey, FieldUpdate, Roster, Section};
