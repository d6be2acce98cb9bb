pub mod document;
pub mod update;
pub mod validate;

pub use document::Document;
pub use update::{
    BatchOutcome, FINALIZE_FIELD, RawUpdate, RelationshipMirror, add_item, apply_batch,
    apply_field_update, delete_item, finalize_current_class, relationship_mirror,
};
pub use validate::{FieldValidator, ValidationRule};
