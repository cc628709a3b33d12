//! Topic patterns.
//!
//! Topics are `/`-separated. In a pattern, a segment that is exactly `+`
//! matches one non-empty segment, and a final segment that is exactly `#`
//! matches everything after the preceding `/` (possibly nothing, possibly
//! several segments) but not the parent topic itself. Every other character
//! is literal.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `+`
    Single,
    /// trailing `#`
    Rest,
}

/// A parsed topic, matched against concrete notification topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    /// `None` for a plain topic, which matches by string equality.
    segments: Option<Vec<Segment>>,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = raw.split('/').collect();
        let last = parts.len() - 1;

        let segments: Vec<Segment> = parts
            .iter()
            .enumerate()
            .map(|(i, part)| match *part {
                "+" => Segment::Single,
                "#" if i == last => Segment::Rest,
                literal => Segment::Literal(literal.to_owned()),
            })
            .collect();

        let is_wildcard = segments
            .iter()
            .any(|s| matches!(s, Segment::Single | Segment::Rest));

        Self {
            raw: raw.to_owned(),
            segments: is_wildcard.then_some(segments),
        }
    }

    /// A plain topic taken as-is: `+` and `#` are ordinary characters.
    pub fn literal(raw: &str) -> Self {
        Self {
            raw: raw.to_owned(),
            segments: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments.is_some()
    }

    pub fn matches(&self, topic: &str) -> bool {
        let Some(segments) = &self.segments else {
            return self.raw == topic;
        };

        let mut parts = topic.split('/');
        for segment in segments {
            match segment {
                Segment::Rest => return parts.next().is_some(),
                Segment::Single => match parts.next() {
                    Some(part) if !part.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(literal) => {
                    if parts.next() != Some(literal.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
