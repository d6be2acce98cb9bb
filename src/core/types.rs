use super::{Result, SheetError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Key of one party member in the store, e.g. `frunk`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterKey(String);

impl CharacterKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed set of characters the store accepts.
///
/// Characters are never created or deleted at runtime; every key coming in
/// from a request is resolved against this roster first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    keys: BTreeSet<String>,
}

impl Roster {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| k.into().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn resolve(&self, raw: &str) -> Result<CharacterKey> {
        let key = raw.trim().to_lowercase();
        if self.keys.contains(&key) {
            Ok(CharacterKey(key))
        } else {
            Err(SheetError::UnknownCharacter(raw.to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Editable top-level section of a character record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Character,
    CurrentClasses,
    Job,
    Relationships,
    Projects,
    Clubs,
    PastClasses,
}

impl Section {
    pub const ALL: [Section; 7] = [
        Section::Character,
        Section::CurrentClasses,
        Section::Job,
        Section::Relationships,
        Section::Projects,
        Section::Clubs,
        Section::PastClasses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Character => "character",
            Section::CurrentClasses => "current_classes",
            Section::Job => "job",
            Section::Relationships => "relationships",
            Section::Projects => "projects",
            Section::Clubs => "clubs",
            Section::PastClasses => "past_classes",
        }
    }

    /// Sections stored as arrays and addressed by index.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            Section::Relationships | Section::Projects | Section::Clubs | Section::PastClasses
        )
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = SheetError;

    fn from_str(s: &str) -> Result<Self> {
        Section::ALL
            .into_iter()
            .find(|section| section.as_str() == s)
            .ok_or_else(|| SheetError::validation(format!("unknown section '{}'", s)))
    }
}

/// One field edit: the unit carried by single saves, batches and the client queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub section: Section,
    pub field: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl FieldUpdate {
    pub fn new(section: Section, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            section,
            field: field.into(),
            value: value.into(),
            index: None,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_normalizes_and_rejects_unknown_keys() {
        let roster = Roster::new(["Frunk", " sharon "]);
        assert_eq!(roster.resolve("FRUNK").unwrap().as_str(), "frunk");
        assert_eq!(roster.resolve("sharon").unwrap().as_str(), "sharon");
        assert!(matches!(
            roster.resolve("bob"),
            Err(SheetError::UnknownCharacter(name)) if name == "bob"
        ));
    }

    #[test]
    fn section_parses_only_known_names() {
        assert_eq!("past_classes".parse::<Section>().unwrap(), Section::PastClasses);
        assert!("inventory".parse::<Section>().is_err());
        assert!(Section::Clubs.is_list());
        assert!(!Section::Job.is_list());
    }
}
