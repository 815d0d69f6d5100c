//! Dot-segmented glob patterns.
//!
//! A pattern such as `servers.web{1,2}.cpu.*` is split on dots and every
//! segment is matched independently against the corresponding segment of a
//! metric name. Segments made only of literal text are compared as strings;
//! segments containing `*`, `?`, `{a,b}` or `[...]` are compiled to an
//! anchored regex. A wildcard never crosses a dot.

use std::fmt;

use regex::Regex;

use crate::error::ValidationError;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Glob(Regex),
}

impl Segment {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Literal(lit) => lit == segment,
            Self::Glob(re) => re.is_match(segment),
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl GlobPattern {
    /// Compiles a pattern.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidPattern` for an empty pattern, an empty
    /// segment, or an unclosed `{` / `[`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tripwire::pattern::GlobPattern;
    ///
    /// let p = GlobPattern::parse("servers.web{1,2}.cpu.*").unwrap();
    /// assert!(p.matches("servers.web1.cpu.user"));
    /// assert!(!p.matches("servers.web3.cpu.user"));
    /// assert!(!p.matches("servers.web1.cpu.user.extra"));
    /// ```
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(invalid(raw, "pattern is empty"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(invalid(raw, "empty segment"));
            }
            if part.contains(&['*', '?', '{', '['][..]) {
                let chars: Vec<char> = part.chars().collect();
                let body = translate(&chars, raw)?;
                let re = Regex::new(&format!("^(?:{body})$"))
                    .map_err(|e| invalid(raw, &e.to_string()))?;
                segments.push(Segment::Glob(re));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The pattern source text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of dot-separated segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false: a compiled pattern has at least one segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Leading segments that are plain literals, in order.
    pub fn literal_prefix(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map_while(|s| match s {
            Segment::Literal(lit) => Some(lit.as_str()),
            Segment::Glob(_) => None,
        })
    }

    /// Returns true if every segment is literal.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Matches a full metric name.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split('.').collect();
        self.matches_segments(&parts)
    }

    /// Matches a metric name that has already been split on dots.
    #[must_use]
    pub fn matches_segments(&self, parts: &[&str]) -> bool {
        parts.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(parts)
                .all(|(seg, part)| seg.matches(part))
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for GlobPattern {}

fn invalid(pattern: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

/// Translates one glob segment (no dots) into a regex body.
fn translate(chars: &[char], pattern: &str) -> Result<String, ValidationError> {
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str("[^.]*"),
            '?' => out.push_str("[^.]"),
            '{' => {
                let close = find_brace_close(chars, i)
                    .ok_or_else(|| invalid(pattern, "unclosed '{'"))?;
                let alternatives = split_alternatives(&chars[i + 1..close]);
                let mut parts = Vec::with_capacity(alternatives.len());
                for alt in alternatives {
                    parts.push(translate(alt, pattern)?);
                }
                out.push_str("(?:");
                out.push_str(&parts.join("|"));
                out.push(')');
                i = close;
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&c| c == ']')
                    .map(|p| p + i + 1)
                    .ok_or_else(|| invalid(pattern, "unclosed '['"))?;
                let class = &chars[i + 1..close];
                if matches!(class, [] | ['!']) {
                    return Err(invalid(pattern, "empty character class"));
                }
                out.push_str(&translate_class(class));
                i = close;
            }
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
        i += 1;
    }
    Ok(out)
}

fn find_brace_close(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_alternatives(body: &[char]) -> Vec<&[char]> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, &c) in body.iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    out.push(&body[start..]);
    out
}

fn translate_class(class: &[char]) -> String {
    let (negated, body) = match class.split_first() {
        Some(('!', rest)) => (true, rest),
        _ => (false, class),
    };
    let mut out = String::from("[");
    if negated {
        out.push('^');
    }
    let last = body.len().saturating_sub(1);
    for (idx, &c) in body.iter().enumerate() {
        if c == '-' && idx != 0 && idx != last {
            out.push('-');
        } else {
            out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
        }
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, name: &str) -> bool {
        GlobPattern::parse(pattern).unwrap().matches(name)
    }

    #[test]
    fn literal_segments() {
        assert!(m("a.b.c", "a.b.c"));
        assert!(!m("a.b.c", "a.b.d"));
        assert!(!m("a.b", "a.b.c"));
        assert!(!m("a.b.c", "a.b"));
    }

    #[test]
    fn star_stays_within_segment() {
        assert!(m("a.*.c", "a.anything.c"));
        assert!(!m("a.*", "a.b.c"));
        assert!(m("a.b*", "a.b"));
        assert!(m("a.b*", "a.bcd"));
        assert!(m("a.*x", "a.yyx"));
    }

    #[test]
    fn question_mark_is_one_char() {
        assert!(m("host?.cpu", "host1.cpu"));
        assert!(!m("host?.cpu", "host12.cpu"));
        assert!(!m("host?.cpu", "host.cpu"));
    }

    #[test]
    fn brace_alternatives() {
        assert!(m("a.{b,c}.d", "a.b.d"));
        assert!(m("a.{b,c}.d", "a.c.d"));
        assert!(!m("a.{b,c}.d", "a.e.d"));
        assert!(m("a.web{1,2*}", "a.web25"));
        assert!(m("a.{x{1,2},y}", "a.x2"));
        assert!(m("a.{,pre}fix", "a.fix"));
    }

    #[test]
    fn character_classes() {
        assert!(m("a.node[0-9]", "a.node7"));
        assert!(!m("a.node[0-9]", "a.nodex"));
        assert!(m("a.[abc]", "a.b"));
        assert!(!m("a.[!abc]", "a.b"));
        assert!(m("a.[!abc]", "a.z"));
        assert!(m("a.[-x]", "a.-"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(m("a.b+c", "a.b+c"));
        assert!(!m("a.b+c", "a.bbc"));
        assert!(m("a.(x)*", "a.(x)y"));
        assert!(!m("a.(x)*", "a.xy"));
    }

    #[test]
    fn rejects_invalid_patterns() {
        assert!(GlobPattern::parse("").is_err());
        assert!(GlobPattern::parse("a..b").is_err());
        assert!(GlobPattern::parse("a.{b,c").is_err());
        assert!(GlobPattern::parse("a.[bc").is_err());
        assert!(GlobPattern::parse("a.[]").is_err());
    }

    #[test]
    fn literal_prefix_stops_at_first_glob() {
        let p = GlobPattern::parse("a.b.*.d").unwrap();
        assert_eq!(p.literal_prefix().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!p.is_literal());
        let p = GlobPattern::parse("*.b").unwrap();
        assert_eq!(p.literal_prefix().count(), 0);
        assert!(GlobPattern::parse("a.b").unwrap().is_literal());
    }

    #[test]
    fn matching_is_deterministic() {
        let p = GlobPattern::parse("a.{b,c}?.[0-3]*").unwrap();
        for name in ["a.bx.1", "a.cc.3zz", "a.b.1", "a.dx.1"] {
            let first = p.matches(name);
            for _ in 0..10 {
                assert_eq!(p.matches(name), first);
            }
        }
    }
}
