//! Controlled vocabulary store.
//!
//! Four immutable sets loaded once per process from a YAML file: topics
//! (optionally hierarchical, e.g. `a/b/c`), projects (with id, optional
//! keyword watchlist, optional active date range), places, and role
//! identifiers. Enrichment tags must be members of these sets; anything else
//! is demoted to `suggested_tags`. Read-only after load, safe to share
//! behind an `Arc`; reload happens by swapping the `Arc` after a fresh
//! parse.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

/// A curated project with an optional keyword watchlist and active window.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl Project {
    /// Whether the project window covers the given date. Open bounds pass.
    pub fn active_on(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.start {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if date > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Deserialize)]
struct VocabFile {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    places: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// In-memory read-only vocabulary lookup.
#[derive(Debug, Default)]
pub struct Vocabulary {
    topics: BTreeSet<String>,
    projects: HashMap<String, Project>,
    places: BTreeSet<String>,
    roles: BTreeSet<String>,
}

impl Vocabulary {
    /// Load from the YAML vocabulary file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary file: {}", path.display()))?;
        let file: VocabFile =
            serde_yml::from_str(&content).with_context(|| "Failed to parse vocabulary file")?;
        Ok(Self::from_parts(
            file.topics,
            file.projects,
            file.places,
            file.roles,
        ))
    }

    pub fn from_parts(
        topics: Vec<String>,
        projects: Vec<Project>,
        places: Vec<String>,
        roles: Vec<String>,
    ) -> Self {
        Self {
            topics: topics.into_iter().collect(),
            projects: projects.into_iter().map(|p| (p.id.clone(), p)).collect(),
            places: places.into_iter().collect(),
            roles: roles.into_iter().collect(),
        }
    }

    pub fn contains_topic(&self, s: &str) -> bool {
        self.topics.contains(s)
    }

    pub fn contains_project(&self, s: &str) -> bool {
        self.projects.contains_key(s)
    }

    pub fn contains_place(&self, s: &str) -> bool {
        self.places.contains(s)
    }

    pub fn contains_role(&self, s: &str) -> bool {
        self.roles.contains(s)
    }

    /// All topics in lexicographic order.
    pub fn list_all_topics(&self) -> Vec<&str> {
        self.topics.iter().map(String::as_str).collect()
    }

    pub fn iter_places(&self) -> impl Iterator<Item = &str> {
        self.places.iter().map(String::as_str)
    }

    pub fn iter_roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn iter_projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    /// Projects whose watchlist matches the text (case-insensitive,
    /// whole-token boundaries). When `as_of` is given, projects outside
    /// their active window are skipped. Result is ordered by project id.
    pub fn match_projects(&self, text: &str, as_of: Option<NaiveDate>) -> BTreeSet<String> {
        let haystack = text.to_lowercase();
        let mut matched = BTreeSet::new();
        for project in self.projects.values() {
            if let Some(date) = as_of {
                if !project.active_on(date) {
                    continue;
                }
            }
            if project
                .keywords
                .iter()
                .any(|kw| contains_token(&haystack, &kw.to_lowercase()))
            {
                matched.insert(project.id.clone());
            }
        }
        matched
    }

    /// Count of distinct watchlist keywords (across all projects) matched in
    /// the text. Feeds the actionability score.
    pub fn watchlist_hits(&self, text: &str) -> usize {
        let haystack = text.to_lowercase();
        let mut hits: BTreeSet<String> = BTreeSet::new();
        for project in self.projects.values() {
            for kw in &project.keywords {
                let lowered = kw.to_lowercase();
                if contains_token(&haystack, &lowered) {
                    hits.insert(lowered);
                }
            }
        }
        hits.len()
    }
}

/// Whole-token substring match: `needle` occurs in `haystack` with
/// non-alphanumeric (or boundary) characters on both sides. Both inputs must
/// already be lowercased.
pub fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let at = start + pos;
        let end = at + needle.len();
        let left_ok = at == 0
            || !haystack[..at]
                .chars()
                .next_back()
                .is_some_and(char::is_alphanumeric);
        let right_ok = end == haystack.len()
            || !haystack[end..].chars().next().is_some_and(char::is_alphanumeric);
        if left_ok && right_ok {
            return true;
        }
        // Advance one full character so the next slice stays on a boundary.
        let step = haystack[at..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(1);
        start = at + step;
        if start >= haystack.len() {
            break;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vocabulary {
        Vocabulary::from_parts(
            vec!["ai/ml".into(), "school/admin".into(), "finance".into()],
            vec![
                Project {
                    id: "project-alpha".into(),
                    keywords: vec!["alpha".into(), "kick-off".into()],
                    start: None,
                    end: None,
                },
                Project {
                    id: "project-omega".into(),
                    keywords: vec!["omega".into()],
                    start: NaiveDate::from_ymd_opt(2026, 1, 1),
                    end: NaiveDate::from_ymd_opt(2026, 6, 30),
                },
            ],
            vec!["Berlin".into(), "Lisbon".into()],
            vec!["presenter".into(), "teacher".into()],
        )
    }

    #[test]
    fn membership_checks() {
        let v = sample();
        assert!(v.contains_topic("ai/ml"));
        assert!(!v.contains_topic("ai"));
        assert!(v.contains_project("project-alpha"));
        assert!(v.contains_place("Berlin"));
        assert!(v.contains_role("teacher"));
    }

    #[test]
    fn topics_are_ordered() {
        let v = sample();
        assert_eq!(
            v.list_all_topics(),
            vec!["ai/ml", "finance", "school/admin"]
        );
    }

    #[test]
    fn match_projects_whole_token() {
        let v = sample();
        let matched = v.match_projects("Project Alpha kick-off in Berlin", None);
        assert!(matched.contains("project-alpha"));
        // "alphabet" must not match the "alpha" keyword.
        let matched = v.match_projects("the alphabet song", None);
        assert!(matched.is_empty());
    }

    #[test]
    fn match_projects_respects_active_window() {
        let v = sample();
        let inside = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let outside = NaiveDate::from_ymd_opt(2027, 3, 1).unwrap();
        assert!(v.match_projects("omega review", Some(inside)).contains("project-omega"));
        assert!(v.match_projects("omega review", Some(outside)).is_empty());
    }

    #[test]
    fn watchlist_hits_counts_distinct_keywords() {
        let v = sample();
        assert_eq!(v.watchlist_hits("alpha alpha omega"), 2);
        assert_eq!(v.watchlist_hits("nothing relevant"), 0);
    }

    #[test]
    fn contains_token_boundaries() {
        assert!(contains_token("a kick-off meeting", "kick-off"));
        assert!(contains_token("alpha", "alpha"));
        assert!(!contains_token("alphabet", "alpha"));
        assert!(!contains_token("xalpha", "alpha"));
        assert!(contains_token("(alpha)", "alpha"));
    }
}
