//! Path layout under the storage root.
//!
//! `<root>/projects/<project>/<task>/<run_id>/<stage>/...` is the current
//! layout; `<task>/<stage>/<run_id>` is accepted read-only for discovery and
//! GC of older runs.

use crate::clock::hex_suffix;
use crate::errors::{StoreError, StoreResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MAX_SLUG_LEN: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Plan,
    Execute,
    Verify,
    Resume,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Plan, Stage::Execute, Stage::Verify, Stage::Resume];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Resume => "resume",
        }
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "plan" => Ok(Self::Plan),
            "execute" => Ok(Self::Execute),
            "verify" => Ok(Self::Verify),
            "resume" => Ok(Self::Resume),
            other => Err(StoreError::InvalidStage(other.to_string())),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kebab-case `[a-z0-9]+(-[a-z0-9]+)*`, at most 128 chars, no `..`, no
/// path separators.
pub fn validate_slug(raw: &str) -> StoreResult<&str> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_SLUG_LEN
        && !raw.contains("..")
        && raw
            .split('-')
            .all(|part| {
                !part.is_empty()
                    && part
                        .chars()
                        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
            });
    if valid {
        Ok(raw)
    } else {
        Err(StoreError::InvalidSlug(raw.to_string()))
    }
}

/// New sortable run id: `YYYYMMDD-HHMMSS-<hex8>`.
pub fn new_run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), hex_suffix(8))
}

/// `YYYYMMDD-HHMMSS-<hex4|hex8>`; lexicographic order is time order.
pub fn is_run_id(raw: &str) -> bool {
    let parts: Vec<&str> = raw.split('-').collect();
    let [date, time, hex] = parts.as_slice() else {
        return false;
    };
    date.len() == 8
        && time.len() == 6
        && date.chars().all(|ch| ch.is_ascii_digit())
        && time.chars().all(|ch| ch.is_ascii_digit())
        && (hex.len() == 4 || hex.len() == 8)
        && hex.chars().all(|ch| ch.is_ascii_hexdigit())
}

/// Root of the local storage tree; honors `AGX_HOME` at construction, after
/// which all path building is pure.
#[derive(Clone, Debug)]
pub struct StoreRoot {
    root: PathBuf,
}

impl StoreRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("AGX_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".agx")
            });
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, project: &str) -> StoreResult<PathBuf> {
        Ok(self.projects_dir().join(validate_slug(project)?))
    }

    pub fn task_dir(&self, project: &str, task: &str) -> StoreResult<PathBuf> {
        Ok(self.project_dir(project)?.join(validate_slug(task)?))
    }
}

pub fn run_stage_dir(task_dir: &Path, run_id: &str, stage: Stage) -> PathBuf {
    task_dir.join(run_id).join(stage.as_str())
}

pub fn legacy_run_stage_dir(task_dir: &Path, stage: Stage, run_id: &str) -> PathBuf {
    task_dir.join(stage.as_str()).join(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_slug_kebab_expected_accepted() {
        assert!(validate_slug("my-task-01").is_ok());
        assert!(validate_slug("a").is_ok());
    }

    #[test]
    fn validate_slug_bad_shapes_expected_rejected() {
        for bad in ["", "-leading", "trailing-", "double--dash", "Upper", "has_underscore",
            "dot..dot", "with/sep"]
        {
            assert!(validate_slug(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_slug(&"a".repeat(129)).is_err());
    }

    #[test]
    fn new_run_id_expected_matches_format() {
        assert!(is_run_id(&new_run_id()));
    }

    #[test]
    fn is_run_id_hex4_and_hex8_expected_accepted() {
        assert!(is_run_id("20260801-120000-abcd"));
        assert!(is_run_id("20260801-120000-abcd1234"));
        assert!(!is_run_id("20260801-120000-abc"));
        assert!(!is_run_id("2026081-120000-abcd1234"));
        assert!(!is_run_id("20260801-120000"));
    }

    #[test]
    fn run_ids_expected_lexicographically_time_sorted() {
        let earlier = "20260801-115959-ffff";
        let later = "20260801-120000-0000";
        assert!(earlier < later);
    }

    #[test]
    fn stage_parse_expected_closed_set() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()).expect("stage should parse"), stage);
        }
        assert!(Stage::parse("deploy").is_err());
    }

    #[test]
    fn task_dir_expected_nested_layout() {
        let root = StoreRoot::new("/tmp/agx-root");
        let dir = root
            .task_dir("proj", "task-one")
            .expect("slugs should validate");
        assert_eq!(dir, PathBuf::from("/tmp/agx-root/projects/proj/task-one"));
    }
}
