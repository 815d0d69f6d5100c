//! Prefix tree over pattern literal prefixes.
//!
//! Each pattern hangs off the node reached by its leading literal segments.
//! A lookup walks the metric name's segments from the root, gathering the
//! patterns stored at every node it passes, and only those candidates get a
//! full segment-wise match. A pattern that starts with a glob lives at the
//! root and is always a candidate.

use std::collections::{BTreeSet, HashMap};

use crate::error::ValidationError;
use crate::pattern::GlobPattern;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    patterns: Vec<usize>,
}

/// Immutable lookup structure built from a full pattern list.
#[derive(Debug, Default)]
pub struct PatternIndex {
    root: Node,
    patterns: Vec<GlobPattern>,
}

impl PatternIndex {
    /// An index that matches nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds an index, skipping duplicates and returning the patterns that
    /// failed to compile alongside it.
    pub fn build<I, S>(patterns: I) -> (Self, Vec<ValidationError>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self::default();
        let mut rejected = Vec::new();
        let mut seen = BTreeSet::new();

        for raw in patterns {
            let raw = raw.as_ref().trim();
            if !seen.insert(raw.to_string()) {
                continue;
            }
            match GlobPattern::parse(raw) {
                Ok(pattern) => index.insert(pattern),
                Err(e) => rejected.push(e),
            }
        }
        (index, rejected)
    }

    fn insert(&mut self, pattern: GlobPattern) {
        let slot = self.patterns.len();
        let mut node = &mut self.root;
        for segment in pattern.literal_prefix() {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.patterns.push(slot);
        self.patterns.push(pattern);
    }

    /// Number of indexed patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if no pattern is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Every pattern that matches `name`, sorted and deduplicated.
    ///
    /// # Examples
    ///
    /// ```
    /// use tripwire::filter::PatternIndex;
    ///
    /// let (index, _) = PatternIndex::build(["servers.*.cpu", "servers.web1.*", "db.*"]);
    /// assert_eq!(index.match_name("servers.web1.cpu"), vec!["servers.*.cpu", "servers.web1.*"]);
    /// assert!(index.match_name("servers.web1").is_empty());
    /// ```
    #[must_use]
    pub fn match_name(&self, name: &str) -> Vec<String> {
        let parts: Vec<&str> = name.split('.').collect();
        let mut out: Vec<String> = Vec::new();

        let mut node = &self.root;
        self.collect(node, &parts, &mut out);
        for part in &parts {
            match node.children.get(*part) {
                Some(child) => {
                    node = child;
                    self.collect(node, &parts, &mut out);
                }
                None => break,
            }
        }

        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect(&self, node: &Node, parts: &[&str], out: &mut Vec<String>) {
        for &slot in &node.patterns {
            let pattern = &self.patterns[slot];
            if pattern.matches_segments(parts) {
                out.push(pattern.as_str().to_string());
            }
        }
    }
}
