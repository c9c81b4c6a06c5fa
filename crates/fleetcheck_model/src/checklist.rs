//! Checklist definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routing category of a checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChecklistKind {
    /// Evaluated once when a driver starts.
    Initial,
    /// Re-evaluated every compliance period.
    Periodic,
    /// Vehicle- or site-specific skills.
    Specialized,
}

/// One entry of a checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChecklistItem {
    /// Header applying to every following question up to the next header.
    Category {
        /// Header text.
        title: String,
    },
    /// A question evaluated per driver.
    Question {
        /// Stable question id; the key in the record maps.
        id: Uuid,
        /// Question text.
        text: String,
        /// Set for questions from the bundled reference set.
        #[serde(default, rename = "readOnly")]
        read_only: bool,
    },
}

impl ChecklistItem {
    /// Creates a user-defined question.
    pub fn question(text: impl Into<String>) -> Self {
        ChecklistItem::Question {
            id: Uuid::new_v4(),
            text: text.into(),
            read_only: false,
        }
    }

    /// Creates a category header.
    pub fn category(title: impl Into<String>) -> Self {
        ChecklistItem::Category {
            title: title.into(),
        }
    }

    /// Returns the question id, or `None` for a category.
    pub fn question_id(&self) -> Option<Uuid> {
        match self {
            ChecklistItem::Question { id, .. } => Some(*id),
            ChecklistItem::Category { .. } => None,
        }
    }
}

/// Questions grouped under the category that precedes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<'a> {
    /// Category title; `None` for questions before the first header.
    pub category: Option<&'a str>,
    /// Questions of the section, in order.
    pub questions: Vec<&'a ChecklistItem>,
}

/// An ordered, categorized list of questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    /// Title; also the remote file name.
    pub title: String,
    /// Routing category.
    pub kind: ChecklistKind,
    /// Items in display order.
    #[serde(default)]
    pub items: Vec<ChecklistItem>,
}

impl Checklist {
    /// Creates an empty checklist.
    pub fn new(title: impl Into<String>, kind: ChecklistKind) -> Self {
        Self {
            title: title.into(),
            kind,
            items: Vec::new(),
        }
    }

    /// Iterates over question items only.
    pub fn questions(&self) -> impl Iterator<Item = &ChecklistItem> {
        self.items
            .iter()
            .filter(|item| matches!(item, ChecklistItem::Question { .. }))
    }

    /// Iterates over user-added questions (not from the reference set).
    pub fn custom_questions(&self) -> impl Iterator<Item = &ChecklistItem> {
        self.items
            .iter()
            .filter(|item| matches!(item, ChecklistItem::Question { read_only: false, .. }))
    }

    /// Groups questions by the category header preceding them.
    ///
    /// Empty categories are kept so headers without questions still show.
    pub fn sections(&self) -> Vec<Section<'_>> {
        let mut sections: Vec<Section<'_>> = Vec::new();
        for item in &self.items {
            match item {
                ChecklistItem::Category { title } => sections.push(Section {
                    category: Some(title.as_str()),
                    questions: Vec::new(),
                }),
                ChecklistItem::Question { .. } => match sections.last_mut() {
                    Some(section) => section.questions.push(item),
                    None => sections.push(Section {
                        category: None,
                        questions: vec![item],
                    }),
                },
            }
        }
        sections
    }

    /// File-system safe form of the title used for remote file names.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .title
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        if stem.is_empty() {
            "untitled".to_string()
        } else {
            stem
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checklist {
        let mut checklist = Checklist::new("Conduite / Sécurité", ChecklistKind::Periodic);
        checklist.items = vec![
            ChecklistItem::question("Orphan question"),
            ChecklistItem::category("Cabine"),
            ChecklistItem::Question {
                id: Uuid::new_v4(),
                text: "Réglage rétroviseurs".into(),
                read_only: true,
            },
            ChecklistItem::question("Custom question"),
            ChecklistItem::category("Empty"),
            ChecklistItem::category("Manoeuvres"),
            ChecklistItem::question("Marche arrière"),
        ];
        checklist
    }

    #[test]
    fn sections_follow_headers() {
        let checklist = sample();
        let sections = checklist.sections();
        let summary: Vec<_> = sections
            .iter()
            .map(|s| (s.category, s.questions.len()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (None, 1),
                (Some("Cabine"), 2),
                (Some("Empty"), 0),
                (Some("Manoeuvres"), 1)
            ]
        );
    }

    #[test]
    fn question_filters() {
        let checklist = sample();
        assert_eq!(checklist.questions().count(), 4);
        assert_eq!(checklist.custom_questions().count(), 3);
        assert!(checklist.items[1].question_id().is_none());
        assert!(checklist.items[0].question_id().is_some());
    }

    #[test]
    fn file_stem_is_safe() {
        assert_eq!(sample().file_stem(), "Conduite _ Sécurité");
        assert_eq!(
            Checklist::new("  ", ChecklistKind::Initial).file_stem(),
            "untitled"
        );
    }

    #[test]
    fn json_shape() {
        let checklist = sample();
        let value = serde_json::to_value(&checklist).unwrap();
        assert_eq!(value["kind"], "periodic");
        assert_eq!(value["items"][1]["type"], "category");
        assert_eq!(value["items"][2]["type"], "question");
        assert_eq!(value["items"][2]["readOnly"], true);

        let decoded: Checklist = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, checklist);
    }

    #[test]
    fn read_only_defaults_to_false() {
        let json = r#"{"type":"question","id":"00000000-0000-0000-0000-000000000001","text":"q"}"#;
        let item: ChecklistItem = serde_json::from_str(json).unwrap();
        assert!(matches!(item, ChecklistItem::Question { read_only: false, .. }));
    }
}
