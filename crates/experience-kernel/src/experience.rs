//! Experience bank: the curated set of natural-language rules injected into prompts.
//!
//! A bank is an ordered mapping from [`ExperienceId`] to text. IDs are opaque
//! tokens partitioned into namespaces by provenance:
//! - `G<n>`: entries that existed when the current step started (original)
//! - `N<n>`: entries allocated during the current step (generated)
//!
//! Banks are values. Readers hold an `Arc<ExperienceBank>` and never observe a
//! mutation; the resolver produces a new bank instead of editing one in place.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Provenance namespace of an experience ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Present in the snapshot the step started from.
    Original,
    /// Allocated by an `Add` or `Merge` during the current step.
    Generated,
}

impl Namespace {
    /// ID prefix used by this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Original => "G",
            Self::Generated => "N",
        }
    }
}

/// Opaque identifier of an experience entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperienceId(String);

impl ExperienceId {
    /// Build an ID in the given namespace.
    pub fn new(namespace: Namespace, index: usize) -> Self {
        Self(format!("{}{}", namespace.prefix(), index))
    }

    pub fn original(index: usize) -> Self {
        Self::new(Namespace::Original, index)
    }

    pub fn generated(index: usize) -> Self {
        Self::new(Namespace::Generated, index)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into namespace and numeric index, if the ID follows the `<prefix><n>` form.
    ///
    /// IDs read from model output may be arbitrary strings; those have no namespace.
    pub fn parts(&self) -> Option<(Namespace, usize)> {
        let namespace = if self.0.starts_with(Namespace::Original.prefix()) {
            Namespace::Original
        } else if self.0.starts_with(Namespace::Generated.prefix()) {
            Namespace::Generated
        } else {
            return None;
        };
        let index = self.0[namespace.prefix().len()..].parse().ok()?;
        Some((namespace, index))
    }
}

impl fmt::Display for ExperienceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExperienceId {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for ExperienceId {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

/// A single experience entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experience {
    pub id: ExperienceId,
    pub text: String,
}

impl Experience {
    pub fn new(id: ExperienceId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }

    /// Format this entry for inclusion in an LLM prompt.
    pub fn format_for_prompt(&self) -> String {
        format!("[{}]. {}", self.id, self.text)
    }
}

/// Ordered mapping from experience ID to text.
///
/// Serializes as a JSON object whose key order is the bank order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperienceBank {
    entries: Vec<Experience>,
}

impl ExperienceBank {
    /// Create an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bank in the original namespace from plain texts, in order.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Experience::new(ExperienceId::original(i), text))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ExperienceId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn contains(&self, id: &ExperienceId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn get(&self, id: &ExperienceId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.text.as_str())
    }

    /// Highest index currently used in `namespace`, if any.
    pub fn max_index(&self, namespace: Namespace) -> Option<usize> {
        self.entries
            .iter()
            .filter_map(|e| e.id.parts())
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, idx)| idx)
            .max()
    }

    /// Renumber every entry into the original namespace (`G0..`), keeping order.
    ///
    /// Applied when a step commits its snapshot, so persisted banks never carry
    /// IDs from the generated namespace.
    pub fn rebased(&self) -> Self {
        Self::from_texts(self.entries.iter().map(|e| e.text.clone()))
    }

    /// Render the first `max_count` entries as prompt lines, or `None` when empty.
    pub fn format_for_prompt(&self, max_count: usize) -> String {
        if self.entries.is_empty() {
            return "None".to_string();
        }
        self.entries
            .iter()
            .take(max_count)
            .map(Experience::format_for_prompt)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Insert a new entry at the end. Returns false if the ID is already taken.
    pub(crate) fn push(&mut self, experience: Experience) -> bool {
        if self.contains(&experience.id) {
            return false;
        }
        self.entries.push(experience);
        true
    }

    /// Replace the text of an existing entry. Returns false if the ID is absent.
    pub(crate) fn replace_text(&mut self, id: &ExperienceId, text: &str) -> bool {
        match self.entries.iter_mut().find(|e| &e.id == id) {
            Some(entry) => {
                entry.text = text.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove an entry. Returns false if the ID is absent.
    pub(crate) fn remove(&mut self, id: &ExperienceId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.id != id);
        self.entries.len() != before
    }
}

impl Serialize for ExperienceBank {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.id, &entry.text)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExperienceBank {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BankVisitor;

        impl<'de> Visitor<'de> for BankVisitor {
            type Value = ExperienceBank;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping experience IDs to text")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut bank = ExperienceBank::new();
                while let Some((id, text)) = access.next_entry::<String, String>()? {
                    let id = ExperienceId::from(id);
                    if !bank.push(Experience::new(id.clone(), text)) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate experience id {id}"
                        )));
                    }
                }
                Ok(bank)
            }
        }

        deserializer.deserialize_map(BankVisitor)
    }
}
