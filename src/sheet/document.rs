//! The store document: every character record in one JSON object.
//!
//! Records are kept as loose JSON so fields written by other pages survive a
//! load-mutate-save cycle untouched. Only the parts this crate edits get a
//! default shape.

use crate::core::{CharacterKey, Result, Section, SheetError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Accepts only a JSON object at the top level.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SheetError::validation(format!(
                "store document must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn to_pretty_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.0.len()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Anti-wipe predicate: does any record carry a non-blank character name?
    pub fn has_any_character_name(&self) -> bool {
        self.0.values().any(|record| {
            record
                .pointer("/character/character_name")
                .and_then(Value::as_str)
                .is_some_and(|name| !name.trim().is_empty())
        })
    }

    pub fn record(&self, key: &CharacterKey) -> Option<&Value> {
        self.0.get(key.as_str())
    }

    pub fn character_name(&self, key: &CharacterKey) -> Option<&str> {
        self.record(key)?
            .pointer("/character/character_name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    /// Mutable access to a record, creating an empty one if absent or malformed.
    pub fn record_mut(&mut self, key: &CharacterKey) -> &mut Map<String, Value> {
        let slot = self
            .0
            .entry(key.as_str().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(map) => map,
            _ => unreachable!("record slot was just normalized to an object"),
        }
    }
}

/// Object-valued section of a record, created on first write.
pub(crate) fn object_section<'a>(
    record: &'a mut Map<String, Value>,
    section: Section,
) -> &'a mut Map<String, Value> {
    let slot = record
        .entry(section.as_str().to_string())
        .or_insert_with(|| default_object(section));
    if !slot.is_object() {
        *slot = default_object(section);
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("section slot was just normalized to an object"),
    }
}

/// Array-valued section of a record, created on first write.
pub(crate) fn list_section<'a>(
    record: &'a mut Map<String, Value>,
    section: Section,
) -> &'a mut Vec<Value> {
    let slot = record
        .entry(section.as_str().to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => items,
        _ => unreachable!("section slot was just normalized to an array"),
    }
}

pub(crate) fn default_object(section: Section) -> Value {
    match section {
        Section::CurrentClasses => json!({
            "class_name": "",
            "class_level": "0",
            "description": ""
        }),
        _ => Value::Object(Map::new()),
    }
}

/// Shape of a freshly added list element.
pub(crate) fn default_item(section: Section) -> Value {
    match section {
        Section::Relationships => json!({
            "npc_id": "",
            "name": "",
            "points": "0",
            "notes": ""
        }),
        Section::Projects => json!({
            "name": "",
            "points_earned": "0",
            "total_points": "0",
            "history": []
        }),
        Section::Clubs => json!({
            "name": "",
            "role": "",
            "notes": ""
        }),
        Section::PastClasses => default_object(Section::CurrentClasses),
        Section::Character | Section::CurrentClasses | Section::Job => Value::Object(Map::new()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Roster;

    #[test]
    fn rejects_non_object_documents() {
        assert!(Document::from_value(json!([1, 2])).is_err());
        assert!(Document::parse(b"\"text\"").is_err());
        assert!(Document::parse(b"{}").unwrap().is_empty());
    }

    #[test]
    fn name_predicate_ignores_blank_names() {
        let blank = Document::from_value(json!({
            "frunk": {"character": {"character_name": "   "}},
            "sharon": {"job": {"title": "smith"}}
        }))
        .unwrap();
        assert!(!blank.has_any_character_name());

        let named = Document::from_value(json!({
            "frunk": {"character": {"character_name": ""}},
            "sharon": {"character": {"character_name": "Sharon"}}
        }))
        .unwrap();
        assert!(named.has_any_character_name());
    }

    #[test]
    fn record_mut_replaces_malformed_records() {
        let roster = Roster::new(["frunk"]);
        let key = roster.resolve("frunk").unwrap();
        let mut doc = Document::from_value(json!({"frunk": "oops"})).unwrap();
        doc.record_mut(&key).insert("job".into(), json!({}));
        assert_eq!(doc.record(&key).unwrap()["job"], json!({}));
    }
}
