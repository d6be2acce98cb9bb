use super::document::{Document, default_item, list_section, object_section};
use super::validate::{FieldValidator, is_valid_field_name};
use crate::core::{CharacterKey, FieldUpdate, Result, Section, SheetError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Field name that turns a `past_classes` update into "finalize current class".
pub const FINALIZE_FIELD: &str = "finalize";

/// Newest entries kept in a project's `history`.
pub const PROJECT_HISTORY_LIMIT: usize = 10;

/// An update as it arrives in a batch, before its section is known to be valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub section: String,
    pub field: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub index: Option<usize>,
}

impl RawUpdate {
    pub fn parse(&self) -> Result<FieldUpdate> {
        Ok(FieldUpdate {
            section: self.section.parse()?,
            field: self.field.clone(),
            value: self.value.clone(),
            index: self.index,
        })
    }
}

impl From<FieldUpdate> for RawUpdate {
    fn from(update: FieldUpdate) -> Self {
        Self {
            section: update.section.as_str().to_string(),
            field: update.field,
            value: update.value,
            index: update.index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub saved: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    /// Relationship indices touched by the batch, for NPC mirroring.
    #[serde(skip)]
    pub relationships: Vec<usize>,
}

/// Applies one field edit to `character`'s record.
///
/// Returns whether the document changed. A finalize with no current class is
/// `Ok(false)`.
pub fn apply_field_update(
    doc: &mut Document,
    character: &CharacterKey,
    update: &FieldUpdate,
    validator: &FieldValidator,
) -> Result<bool> {
    if update.section == Section::PastClasses && update.field == FINALIZE_FIELD {
        return Ok(finalize_current_class(doc, character));
    }
    if !is_valid_field_name(&update.field) {
        return Err(SheetError::validation(format!(
            "invalid field name '{}'",
            update.field
        )));
    }

    let value = Value::String(validator.clean(&update.field, &update.value));
    let record = doc.record_mut(character);

    if !update.section.is_list() {
        let section = object_section(record, update.section);
        let changed = section.get(&update.field) != Some(&value);
        section.insert(update.field.clone(), value);
        return Ok(changed);
    }

    let index = update.index.ok_or_else(|| {
        SheetError::validation(format!("section '{}' requires an index", update.section))
    })?;
    let item = list_item_mut(record, update.section, index)?;
    let changed = item.get(&update.field) != Some(&value);

    if update.section == Section::Projects && update.field == "points_earned" && changed {
        push_history(item, &value);
    }
    item.insert(update.field.clone(), value);
    Ok(changed)
}

/// Applies every update in memory; the caller persists once afterwards.
pub fn apply_batch(
    doc: &mut Document,
    character: &CharacterKey,
    updates: &[RawUpdate],
    validator: &FieldValidator,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for raw in updates {
        let applied = raw
            .parse()
            .and_then(|update| apply_field_update(doc, character, &update, validator).map(|_| update));
        match applied {
            Ok(update) => {
                outcome.saved += 1;
                if update.section == Section::Relationships {
                    if let Some(index) = update.index {
                        if !outcome.relationships.contains(&index) {
                            outcome.relationships.push(index);
                        }
                    }
                }
            }
            Err(err) => {
                outcome.errors += 1;
                outcome
                    .messages
                    .push(format!("{}.{}: {}", raw.section, raw.field, err));
            }
        }
    }

    outcome
}

/// Moves `current_classes` onto the end of `past_classes` and resets it.
///
/// Does nothing unless a class name is set.
pub fn finalize_current_class(doc: &mut Document, character: &CharacterKey) -> bool {
    let has_class = doc
        .record(character)
        .and_then(|record| record.pointer("/current_classes/class_name"))
        .and_then(Value::as_str)
        .is_some_and(|name| !name.trim().is_empty());
    if !has_class {
        return false;
    }

    let record = doc.record_mut(character);
    let finished = record
        .insert(
            Section::CurrentClasses.as_str().to_string(),
            default_item(Section::PastClasses),
        )
        .unwrap_or_default();
    list_section(record, Section::PastClasses).push(finished);
    true
}

/// Appends a default element to a list section and returns its index.
pub fn add_item(doc: &mut Document, character: &CharacterKey, section: Section) -> Result<usize> {
    ensure_list(section)?;
    let items = list_section(doc.record_mut(character), section);
    items.push(default_item(section));
    Ok(items.len() - 1)
}

/// Removes and returns the element at `index`.
pub fn delete_item(
    doc: &mut Document,
    character: &CharacterKey,
    section: Section,
    index: usize,
) -> Result<Value> {
    ensure_list(section)?;
    let items = list_section(doc.record_mut(character), section);
    if index >= items.len() {
        return Err(SheetError::validation(format!(
            "{} has no item at index {}",
            section, index
        )));
    }
    Ok(items.remove(index))
}

/// What to copy into the external NPC record after a relationship edit.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipMirror {
    pub npc_id: String,
    pub pc_name: String,
    pub points: String,
    pub notes: String,
}

/// Builds the mirror payload when the relationship links to an NPC id.
pub fn relationship_mirror(
    doc: &Document,
    character: &CharacterKey,
    index: usize,
) -> Option<RelationshipMirror> {
    let item = doc.record(character)?.get("relationships")?.get(index)?;
    let npc_id = item.get("npc_id").and_then(Value::as_str)?.trim();
    if npc_id.is_empty() {
        return None;
    }
    let text = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(RelationshipMirror {
        npc_id: npc_id.to_string(),
        pc_name: character.as_str().to_string(),
        points: text("points"),
        notes: text("notes"),
    })
}

fn ensure_list(section: Section) -> Result<()> {
    if section.is_list() {
        Ok(())
    } else {
        Err(SheetError::validation(format!(
            "section '{}' does not hold items",
            section
        )))
    }
}

/// Existing item at `index`, or a fresh one appended when `index` is the
/// current length.
fn list_item_mut(
    record: &mut Map<String, Value>,
    section: Section,
    index: usize,
) -> Result<&mut Map<String, Value>> {
    let items = list_section(record, section);
    if index > items.len() {
        return Err(SheetError::validation(format!(
            "{}[{}] is past the end of the list ({} items)",
            section,
            index,
            items.len()
        )));
    }
    if index == items.len() {
        items.push(default_item(section));
    }
    let slot = &mut items[index];
    if !slot.is_object() {
        *slot = default_item(section);
    }
    match slot {
        Value::Object(map) => Ok(map),
        _ => unreachable!("list item was just normalized to an object"),
    }
}

fn push_history(project: &mut Map<String, Value>, points_earned: &Value) {
    let history = project
        .entry("history".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !history.is_array() {
        *history = Value::Array(Vec::new());
    }
    if let Value::Array(entries) = history {
        entries.push(json!({
            "at": chrono::Utc::now().to_rfc3339(),
            "points_earned": points_earned,
        }));
        let overflow = entries.len().saturating_sub(PROJECT_HISTORY_LIMIT);
        entries.drain(..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Roster;

    fn frunk() -> CharacterKey {
        Roster::new(["frunk"]).resolve("frunk").unwrap()
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn scalar_section_update_validates_value() {
        let mut d = doc(json!({"frunk": {"character": {"character_name": "Joe"}}}));
        let update = FieldUpdate::new(Section::Character, "level", "<i>2</i>");
        assert!(apply_field_update(&mut d, &frunk(), &update, &FieldValidator::default()).unwrap());
        assert_eq!(d.record(&frunk()).unwrap()["character"]["level"], "2");
        assert_eq!(d.record(&frunk()).unwrap()["character"]["character_name"], "Joe");
    }

    #[test]
    fn list_update_requires_index_and_appends_at_end() {
        let mut d = Document::new();
        let v = FieldValidator::default();
        let missing = FieldUpdate::new(Section::Clubs, "name", "Archery");
        assert!(apply_field_update(&mut d, &frunk(), &missing, &v).is_err());

        let first = FieldUpdate::new(Section::Clubs, "name", "Archery").at(0);
        apply_field_update(&mut d, &frunk(), &first, &v).unwrap();
        let second = FieldUpdate::new(Section::Clubs, "name", "Chess").at(1);
        apply_field_update(&mut d, &frunk(), &second, &v).unwrap();
        let clubs = d.record(&frunk()).unwrap()["clubs"].as_array().unwrap();
        assert_eq!(clubs.len(), 2);
        assert_eq!(clubs[0]["name"], "Archery");
        assert_eq!(clubs[1]["name"], "Chess");
    }

    #[test]
    fn list_index_far_past_the_end_is_rejected() {
        let mut d = doc(json!({"frunk": {"clubs": [{"name": "Archery"}]}}));
        let before = d.clone();
        let v = FieldValidator::default();

        let update = FieldUpdate::new(Section::Clubs, "name", "x").at(2_000_000);
        let err = apply_field_update(&mut d, &frunk(), &update, &v).unwrap_err();

        assert!(matches!(err, SheetError::Validation(_)));
        assert_eq!(d, before);
    }

    #[test]
    fn project_points_keep_bounded_history() {
        let mut d = Document::new();
        let v = FieldValidator::default();
        for points in 1..=(PROJECT_HISTORY_LIMIT + 3) {
            let update =
                FieldUpdate::new(Section::Projects, "points_earned", points.to_string()).at(0);
            apply_field_update(&mut d, &frunk(), &update, &v).unwrap();
        }
        let history = d.record(&frunk()).unwrap()["projects"][0]["history"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(history.len(), PROJECT_HISTORY_LIMIT);
        assert_eq!(history.last().unwrap()["points_earned"], "13");
        assert_eq!(history[0]["points_earned"], "4");
    }

    #[test]
    fn finalize_moves_current_class_to_past() {
        let mut d = doc(json!({"frunk": {
            "current_classes": {"class_name": "Alchemy", "class_level": "3", "description": "potions"}
        }}));
        let update = FieldUpdate::new(Section::PastClasses, FINALIZE_FIELD, "");
        assert!(apply_field_update(&mut d, &frunk(), &update, &FieldValidator::default()).unwrap());

        let record = d.record(&frunk()).unwrap();
        assert_eq!(record["past_classes"][0]["class_name"], "Alchemy");
        assert_eq!(record["current_classes"]["class_name"], "");
    }

    #[test]
    fn finalize_without_class_name_is_a_no_op() {
        let original = json!({"frunk": {
            "current_classes": {"class_name": "", "class_level": "3"},
            "past_classes": [{"class_name": "Herbalism"}]
        }});
        let mut d = doc(original.clone());
        assert!(!finalize_current_class(&mut d, &frunk()));
        assert_eq!(d.into_value(), original);
    }

    #[test]
    fn batch_counts_successes_and_failures_independently() {
        let mut d = Document::new();
        let updates: Vec<RawUpdate> = serde_json::from_value(json!([
            {"section": "character", "field": "character_name", "value": "Joe"},
            {"section": "inventory", "field": "sword", "value": "1"},
            {"section": "job", "field": "title", "value": "Smith"},
            {"section": "spells", "field": "fireball", "value": "3"},
            {"section": "relationships", "field": "points", "value": "4", "index": 0}
        ]))
        .unwrap();

        let outcome = apply_batch(&mut d, &frunk(), &updates, &FieldValidator::default());
        assert_eq!(outcome.saved, 3);
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.relationships, vec![0]);
        assert_eq!(outcome.messages.len(), 2);
    }

    #[test]
    fn add_and_delete_items() {
        let mut d = Document::new();
        assert_eq!(add_item(&mut d, &frunk(), Section::Projects).unwrap(), 0);
        assert_eq!(add_item(&mut d, &frunk(), Section::Projects).unwrap(), 1);
        assert!(add_item(&mut d, &frunk(), Section::Job).is_err());

        let removed = delete_item(&mut d, &frunk(), Section::Projects, 0).unwrap();
        assert_eq!(removed["points_earned"], "0");
        assert!(delete_item(&mut d, &frunk(), Section::Projects, 5).is_err());
    }

    #[test]
    fn mirror_only_for_linked_relationships() {
        let d = doc(json!({"frunk": {"relationships": [
            {"npc_id": "", "points": "1"},
            {"npc_id": "npc-7", "points": "5", "notes": "owes a favour"}
        ]}}));
        assert!(relationship_mirror(&d, &frunk(), 0).is_none());
        let mirror = relationship_mirror(&d, &frunk(), 1).unwrap();
        assert_eq!(mirror.npc_id, "npc-7");
        assert_eq!(mirror.pc_name, "frunk");
        assert_eq!(mirror.points, "5");
    }
}
