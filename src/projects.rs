//! Project/employer detection.
//!
//! A lookup table of project names and aliases, matched as case-insensitive
//! substrings of the query. When a query names a project, hydrated records
//! are narrowed to those tagged with it, so project-scoped metrics are not
//! mixed with career totals.

use crate::config::ProjectConfig;
use crate::models::SkillRecord;

#[derive(Debug, Clone, Default)]
pub struct ProjectMatcher {
    /// (canonical name, lowercase needles including the name itself)
    entries: Vec<(String, Vec<String>)>,
}

impl ProjectMatcher {
    pub fn new(projects: &[ProjectConfig]) -> Self {
        let entries = projects
            .iter()
            .map(|p| {
                let mut needles = vec![p.name.to_lowercase()];
                needles.extend(p.aliases.iter().map(|a| a.to_lowercase()));
                needles.retain(|n| !n.trim().is_empty());
                (p.name.clone(), needles)
            })
            .collect();
        Self { entries }
    }

    /// First project, in table order, whose name or alias occurs in `query`.
    pub fn detect(&self, query: &str) -> Option<&str> {
        let q = query.to_lowercase();
        self.entries
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| q.contains(n.as_str())))
            .map(|(name, _)| name.as_str())
    }

    /// Keeps records whose `related_project` mentions `project`. Falls back to
    /// the unfiltered list when nothing is tagged with it.
    pub fn filter(&self, project: &str, records: Vec<SkillRecord>) -> Vec<SkillRecord> {
        let needle = project.to_lowercase();
        let (tagged, untagged): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| {
            r.related_project
                .as_deref()
                .map(|p| p.to_lowercase().contains(&needle))
                .unwrap_or(false)
        });
        if tagged.is_empty() {
            return untagged;
        }
        tagged
    }
}
