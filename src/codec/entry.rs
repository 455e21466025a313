use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::archive::Reference;

/// Discriminant of an entry variant, as written on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    Term = 0,
    Index = 1,
    Page = 2,
}

impl EntryKind {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(EntryKind::Term),
            1 => Some(EntryKind::Index),
            2 => Some(EntryKind::Page),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// What a posting points at.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// Another term related to the subject.
    Term { related: String },
    /// Another index that covers the subject.
    Index { index: Reference },
    /// A page containing the subject. An empty position map means the page
    /// carries no positions; a `None` fragment means no text was captured for
    /// that offset.
    Page {
        page: Reference,
        title: Option<String>,
        positions: BTreeMap<i32, Option<String>>,
    },
}

/// One posting in the inverted index. Immutable once built.
///
/// Entries sort by subject, then by descending relevance, then by kind and
/// target, so a term's best postings come first.
#[derive(Clone, Debug)]
pub struct TermEntry {
    subject: String,
    relevance: f32,
    target: Target,
}

impl TermEntry {
    pub fn new(subject: impl Into<String>, relevance: f32, target: Target) -> Self {
        Self {
            subject: subject.into(),
            relevance,
            target,
        }
    }

    pub fn term(subject: impl Into<String>, related: impl Into<String>, relevance: f32) -> Self {
        Self::new(
            subject,
            relevance,
            Target::Term {
                related: related.into(),
            },
        )
    }

    pub fn index(subject: impl Into<String>, index: Reference, relevance: f32) -> Self {
        Self::new(subject, relevance, Target::Index { index })
    }

    pub fn page(subject: impl Into<String>, page: Reference, relevance: f32) -> Self {
        Self::new(
            subject,
            relevance,
            Target::Page {
                page,
                title: None,
                positions: BTreeMap::new(),
            },
        )
    }

    /// Set the title of a page entry. No effect on other kinds.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        if let Target::Page { title: t, .. } = &mut self.target {
            *t = Some(title.into());
        }
        self
    }

    /// Add a position to a page entry. No effect on other kinds.
    pub fn with_position(mut self, offset: i32, fragment: Option<&str>) -> Self {
        if let Target::Page { positions, .. } = &mut self.target {
            positions.insert(offset, fragment.map(str::to_string));
        }
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn relevance(&self) -> f32 {
        self.relevance
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn kind(&self) -> EntryKind {
        match self.target {
            Target::Term { .. } => EntryKind::Term,
            Target::Index { .. } => EntryKind::Index,
            Target::Page { .. } => EntryKind::Page,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match &self.target {
            Target::Page { title, .. } => title.as_deref(),
            _ => None,
        }
    }
}

impl Ord for TermEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.subject
            .cmp(&other.subject)
            .then_with(|| other.relevance.total_cmp(&self.relevance))
            .then_with(|| self.target.cmp(&other.target))
    }
}

impl PartialOrd for TermEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TermEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TermEntry {}

impl fmt::Display for TermEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.3}) -> ", self.subject, self.relevance)?;
        match &self.target {
            Target::Term { related } => write!(f, "term {}", related),
            Target::Index { index } => write!(f, "index {}", index),
            Target::Page { page, title, positions } => {
                write!(f, "page {}", page)?;
                if let Some(title) = title {
                    write!(f, " \"{}\"", title)?;
                }
                if !positions.is_empty() {
                    write!(f, " @{:?}", positions.keys().collect::<Vec<_>>())?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn page_ref(n: u8) -> Reference {
        Reference::digest(&[n])
    }

    #[test]
    fn test_ordering_prefers_relevance_within_subject() {
        let low = TermEntry::term("rust", "cargo", 0.2);
        let high = TermEntry::term("rust", "borrowck", 0.9);
        let other = TermEntry::term("apple", "pie", 0.1);

        let sorted: Vec<_> = [low.clone(), high.clone(), other.clone()]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(sorted, vec![other, high, low]);
    }

    #[test]
    fn test_kind_breaks_ties() {
        let term = TermEntry::term("x", "y", 0.5);
        let page = TermEntry::page("x", page_ref(1), 0.5);
        assert!(term < page);
        assert_eq!(page.kind(), EntryKind::Page);
        assert_eq!(EntryKind::from_code(1), Some(EntryKind::Index));
        assert_eq!(EntryKind::from_code(3), None);
    }

    #[test]
    fn test_page_builders() {
        let e = TermEntry::page("x", page_ref(2), 1.0)
            .with_title("Front page")
            .with_position(4, Some("hello"))
            .with_position(9, None);
        assert_eq!(e.title(), Some("Front page"));
        match e.target() {
            Target::Page { positions, .. } => {
                assert_eq!(positions.len(), 2);
                assert_eq!(positions[&9], None);
            }
            other => panic!("unexpected target {other:?}"),
        }
        // builders are no-ops for other kinds
        let t = TermEntry::term("x", "y", 0.1).with_title("ignored");
        assert_eq!(t.title(), None);
    }
}
