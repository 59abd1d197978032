//! # BIO Tags
//!
//! String tag handling for the BIO (Begin-Inside-Outside) scheme. Tags are
//! kept as plain strings (`B-PER`, `I-PER`, `O`) so any tag set read from a
//! `tags.txt` file works; tags without a `B-`/`I-` prefix (other than `O`)
//! are treated as single-token entities.

use std::fmt;

/// The outside tag.
pub const OUTSIDE: &str = "O";

/// Position of a tag inside its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagPosition {
    Begin,
    Inside,
    /// A bare tag such as `DATE`: a complete one-token entity.
    Single,
    Outside,
}

/// A parsed tag: its position and entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag<'a> {
    pub position: TagPosition,
    pub entity: &'a str,
}

impl<'a> Tag<'a> {
    /// Parse a raw tag string.
    pub fn parse(raw: &'a str) -> Self {
        if raw == OUTSIDE || raw.is_empty() {
            return Self {
                position: TagPosition::Outside,
                entity: "",
            };
        }
        if let Some(entity) = raw.strip_prefix("B-") {
            return Self {
                position: TagPosition::Begin,
                entity,
            };
        }
        if let Some(entity) = raw.strip_prefix("I-") {
            return Self {
                position: TagPosition::Inside,
                entity,
            };
        }
        Self {
            position: TagPosition::Single,
            entity: raw,
        }
    }

    /// Check if this is an "Inside" tag.
    pub fn is_inside(&self) -> bool {
        self.position == TagPosition::Inside
    }

    /// Check if transitioning from `from` tag to `to` tag is valid.
    ///
    /// An `I-X` may only follow `B-X` or `I-X`.
    pub fn is_valid_transition(from: &str, to: &str) -> bool {
        let to = Tag::parse(to);
        if !to.is_inside() {
            return true;
        }
        let from = Tag::parse(from);
        matches!(from.position, TagPosition::Begin | TagPosition::Inside)
            && from.entity == to.entity
    }
}

impl fmt::Display for Tag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            TagPosition::Begin => write!(f, "B-{}", self.entity),
            TagPosition::Inside => write!(f, "I-{}", self.entity),
            TagPosition::Single => write!(f, "{}", self.entity),
            TagPosition::Outside => write!(f, "{OUTSIDE}"),
        }
    }
}

/// A labeled span with token indices (`end` exclusive).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    pub entity: String,
    pub start: usize,
    pub end: usize,
}

/// Extract entity chunks from a tag sequence.
///
/// A stray `I-X` (not following `B-X`/`I-X`) opens a new chunk, matching the
/// lenient behaviour of conlleval.
pub fn chunks<S: AsRef<str>>(tags: &[S]) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut open: Option<(String, usize)> = None;

    for (i, raw) in tags.iter().enumerate() {
        let tag = Tag::parse(raw.as_ref());
        let continues = tag.is_inside()
            && open
                .as_ref()
                .is_some_and(|(entity, _)| entity == tag.entity);
        if continues {
            continue;
        }
        if let Some((entity, start)) = open.take() {
            out.push(Chunk {
                entity,
                start,
                end: i,
            });
        }
        match tag.position {
            TagPosition::Begin | TagPosition::Inside => {
                open = Some((tag.entity.to_string(), i));
            }
            TagPosition::Single => out.push(Chunk {
                entity: tag.entity.to_string(),
                start: i,
                end: i + 1,
            }),
            TagPosition::Outside => {}
        }
    }

    if let Some((entity, start)) = open {
        out.push(Chunk {
            entity,
            start,
            end: tags.len(),
        });
    }
    out
}
