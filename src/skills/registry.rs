//! Skill Registry
//!
//! Holds an immutable [`Snapshot`] of the skills root behind a lock that is
//! only taken to clone or replace an `Arc`. Readers keep the snapshot they
//! grabbed; `reload` builds a complete new one off to the side and swaps the
//! pointer, so a half-built catalog is never observable.

use super::loader::{load_dir, Rejected};
use super::types::{SkillDefinition, SkillError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Lowercased trigger phrase -> skill name, in match order.
///
/// Order is skill name ascending, then trigger declaration order. The first
/// trigger contained in the query wins.
#[derive(Debug, Default, Clone)]
pub struct TriggerIndex {
    entries: Vec<(String, String)>,
}

impl TriggerIndex {
    /// Build from skills already sorted by name
    fn build(skills: &[Arc<SkillDefinition>]) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();
        for skill in skills {
            for trigger in &skill.triggers {
                let phrase = trigger.trim().to_lowercase();
                if let Some((_, owner)) = entries.iter().find(|(p, _)| *p == phrase) {
                    warn!(trigger = %phrase, skill = %skill.name, owner = %owner, "Duplicate trigger ignored");
                    continue;
                }
                entries.push((phrase, skill.name.clone()));
            }
        }
        Self { entries }
    }

    /// Name of the skill owning the first trigger found in `text`
    pub fn find(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.entries
            .iter()
            .find(|(phrase, _)| text.contains(phrase.as_str()))
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One consistent view of the skills root
#[derive(Debug, Default)]
pub struct Snapshot {
    skills: Vec<Arc<SkillDefinition>>,
    by_name: HashMap<String, usize>,
    triggers: TriggerIndex,
    rejected: Vec<Rejected>,
    loaded_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Snapshot {
    pub fn from_skills(skills: Vec<SkillDefinition>, rejected: Vec<Rejected>) -> Self {
        let mut skills: Vec<Arc<SkillDefinition>> = skills.into_iter().map(Arc::new).collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills.dedup_by(|b, a| {
            let duplicate = a.name == b.name;
            if duplicate {
                warn!(skill = %b.name, "Duplicate skill name ignored");
            }
            duplicate
        });

        let by_name = skills.iter().enumerate().map(|(i, s)| (s.name.clone(), i)).collect();
        let triggers = TriggerIndex::build(&skills);

        Self {
            skills,
            by_name,
            triggers,
            rejected,
            loaded_at: Some(chrono::Utc::now()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<SkillDefinition>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.skills[i]))
    }

    pub fn find_by_trigger(&self, text: &str) -> Option<Arc<SkillDefinition>> {
        self.triggers.find(text).and_then(|name| self.get(name))
    }

    /// Skills in name order
    pub fn skills(&self) -> &[Arc<SkillDefinition>] {
        &self.skills
    }

    pub fn triggers(&self) -> &TriggerIndex {
        &self.triggers
    }

    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    pub fn loaded_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

/// Counts reported by a reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReloadSummary {
    pub loaded: usize,
    pub rejected: usize,
    pub triggers: usize,
}

/// Registry of skills under one root directory
pub struct SkillRegistry {
    root: PathBuf,
    current: RwLock<Arc<Snapshot>>,
}

impl SkillRegistry {
    /// Empty registry; call [`reload`](Self::reload) to populate
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Create and load in one step
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SkillError> {
        let registry = Self::new(root);
        registry.reload()?;
        Ok(registry)
    }

    /// Scan `dir` into a fresh snapshot without touching any registry
    pub fn load(dir: &Path) -> Result<Snapshot, SkillError> {
        let report = load_dir(dir)?;
        Ok(Snapshot::from_skills(report.skills, report.rejected))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current snapshot. Cheap; hold it to get a consistent view across calls.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SkillDefinition>> {
        self.snapshot().get(name)
    }

    pub fn find_by_trigger(&self, text: &str) -> Option<Arc<SkillDefinition>> {
        self.snapshot().find_by_trigger(text)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild from disk and swap atomically. On error the old snapshot stays.
    pub fn reload(&self) -> Result<ReloadSummary, SkillError> {
        let snapshot = Self::load(&self.root).map_err(|e| {
            warn!(root = %self.root.display(), error = %e, "Skill reload failed, keeping previous snapshot");
            e
        })?;

        let summary = ReloadSummary {
            loaded: snapshot.len(),
            rejected: snapshot.rejected().len(),
            triggers: snapshot.triggers().len(),
        };
        *self.current.write() = Arc::new(snapshot);

        info!(
            root = %self.root.display(),
            loaded = summary.loaded,
            rejected = summary.rejected,
            triggers = summary.triggers,
            "Skills loaded"
        );
        Ok(summary)
    }
}
