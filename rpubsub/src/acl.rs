//! Topic Pattern Permissions
//!
//! Every endpoint declares, one per line, the topic names it may publish to
//! and subscribe to:
//!
//! ```text
//! pub=/orders/new
//! pub=/orders/**
//! sub=/customer.*.updates
//! ```
//!
//! ## Matching
//! A candidate topic name is evaluated against the declared patterns in three
//! passes, each pass walking the patterns in declaration order:
//! 1. ​**​Exact​**​: patterns without wildcards, compared case-insensitively
//! 2. ​**​Prefix​**​: patterns whose only wildcard is a trailing `**`
//! 3. ​**​Glob​**​: everything else, `*` stays within one `.`-separated segment
//!    while `**` spans anything
//!
//! The first pattern that matches is returned so callers can record which
//! declaration granted the access.

use std::fmt;

use anyhow::anyhow;
use regex::{Regex, RegexBuilder};

use crate::Result;

const PUB_PREFIX: &str = "pub=";
const SUB_PREFIX: &str = "sub=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Publish,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternKind {
    Exact,
    Prefix,
    Glob,
}

/// One declared topic pattern.
#[derive(Clone)]
pub struct Pattern {
    text: String,
    kind: PatternKind,
    lowered: String,
    regex: Option<Regex>,
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("empty topic pattern"));
        }
        let lowered = text.to_lowercase();
        let (kind, lowered, regex) = if !text.contains('*') {
            (PatternKind::Exact, lowered, None)
        } else if let Some(prefix) = lowered.strip_suffix("**").filter(|p| !p.contains('*')) {
            (PatternKind::Prefix, prefix.to_owned(), None)
        } else {
            (PatternKind::Glob, lowered, Some(Self::compile(text)?))
        };
        Ok(Self { text: text.to_owned(), kind, lowered, regex })
    }

    fn compile(text: &str) -> Result<Regex> {
        let body = text
            .split("**")
            .map(|part| part.split('*').map(regex::escape).collect::<Vec<_>>().join("[^.]*"))
            .collect::<Vec<_>>()
            .join(".*");
        RegexBuilder::new(&format!("^{}$", body))
            .case_insensitive(true)
            .build()
            .map_err(|e| anyhow!("invalid topic pattern {}, {:?}", text, e))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[inline]
    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// `name_lower` must be the lowercased form of `name`.
    #[inline]
    fn is_match(&self, name: &str, name_lower: &str) -> bool {
        match self.kind {
            PatternKind::Exact => self.lowered == name_lower,
            PatternKind::Prefix => name_lower.starts_with(&self.lowered),
            PatternKind::Glob => self.regex.as_ref().map(|r| r.is_match(name)).unwrap_or_default(),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

/// Ordered publish and subscribe pattern lists of one endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patterns {
    pub_patterns: Vec<Pattern>,
    sub_patterns: Vec<Pattern>,
}

impl Patterns {
    /// Parses the `pub=`/`sub=` line format. Lines that cannot be understood
    /// are logged and skipped, they never fail the whole endpoint.
    pub fn parse(text: &str) -> Self {
        let mut patterns = Patterns::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (action, raw) = if let Some(raw) = line.strip_prefix(PUB_PREFIX) {
                (Action::Publish, raw)
            } else if let Some(raw) = line.strip_prefix(SUB_PREFIX) {
                (Action::Subscribe, raw)
            } else {
                log::warn!("Ignoring invalid topic pattern line `{}`, expected pub= or sub= prefix", line);
                continue;
            };
            match Pattern::parse(raw) {
                Ok(p) => patterns.push(action, p),
                Err(e) => log::warn!("Ignoring invalid topic pattern line `{}`, {:?}", line, e),
            }
        }
        patterns
    }

    #[inline]
    pub fn push(&mut self, action: Action, pattern: Pattern) {
        match action {
            Action::Publish => self.pub_patterns.push(pattern),
            Action::Subscribe => self.sub_patterns.push(pattern),
        }
    }

    #[inline]
    pub fn get(&self, action: Action) -> &[Pattern] {
        match action {
            Action::Publish => &self.pub_patterns,
            Action::Subscribe => &self.sub_patterns,
        }
    }

    /// Returns the first pattern granting `action` on `topic_name`.
    pub fn is_allowed(&self, action: Action, topic_name: &str) -> Option<&Pattern> {
        let patterns = self.get(action);
        let name_lower = topic_name.to_lowercase();
        [PatternKind::Exact, PatternKind::Prefix, PatternKind::Glob].into_iter().find_map(|kind| {
            patterns.iter().filter(|p| p.kind == kind).find(|p| p.is_match(topic_name, &name_lower))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_kinds() {
        assert_eq!(Pattern::parse("/a/b").unwrap().kind(), PatternKind::Exact);
        assert_eq!(Pattern::parse("/a/**").unwrap().kind(), PatternKind::Prefix);
        assert_eq!(Pattern::parse("/a/*").unwrap().kind(), PatternKind::Glob);
        assert_eq!(Pattern::parse("/a/**/c").unwrap().kind(), PatternKind::Glob);
        assert!(Pattern::parse("   ").is_err());
    }

    #[test]
    fn glob_segments() {
        let p = Pattern::parse("orders.*.new").unwrap();
        assert!(p.is_match("orders.eu.new", "orders.eu.new"));
        assert!(!p.is_match("orders.eu.west.new", "orders.eu.west.new"));
        let p = Pattern::parse("orders.**.new").unwrap();
        assert!(p.is_match("orders.eu.west.new", "orders.eu.west.new"));
        let p = Pattern::parse("/Orders/*").unwrap();
        assert!(p.is_match("/orders/x", "/orders/x"));
        let p = Pattern::parse("/a+b/*").unwrap();
        assert!(p.is_match("/a+b/c", "/a+b/c"));
        assert!(!p.is_match("/aab/c", "/aab/c"));
    }

    #[test]
    fn parse_lines() {
        let patterns = Patterns::parse("pub=/a/**\n\n  sub=/b/*  \nbogus=/c\npub=/d");
        assert_eq!(patterns.get(Action::Publish).len(), 2);
        assert_eq!(patterns.get(Action::Subscribe).len(), 1);
        assert_eq!(patterns.get(Action::Subscribe)[0].as_str(), "/b/*");
    }

    #[test]
    fn evaluation_order() {
        let patterns = Patterns::parse("pub=/orders/*\npub=/orders/**\npub=/ORDERS/new");
        //exact beats prefix, prefix beats glob, regardless of declaration order
        assert_eq!(patterns.is_allowed(Action::Publish, "/orders/new").map(|p| p.as_str()), Some("/ORDERS/new"));
        assert_eq!(patterns.is_allowed(Action::Publish, "/orders/old").map(|p| p.as_str()), Some("/orders/**"));
        assert!(patterns.is_allowed(Action::Publish, "/invoices/new").is_none());
        assert!(patterns.is_allowed(Action::Subscribe, "/orders/new").is_none());

        let patterns = Patterns::parse("sub=/x/*/z\nsub=/x/y/*");
        assert_eq!(patterns.is_allowed(Action::Subscribe, "/x/y/z").map(|p| p.as_str()), Some("/x/*/z"));
    }
}
