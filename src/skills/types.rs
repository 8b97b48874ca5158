//! Skill Type Definitions
//!
//! Core data structures for the skill system plus the name and path checks
//! applied at load time and again when a drafted skill is committed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// File name of a skill inside its directory
pub const SKILL_FILE: &str = "SKILL.md";

/// Upper bound for any shell skill timeout (seconds)
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Placeholder replaced by the user's input in generation-wrapped skills
pub const ARGUMENTS_PLACEHOLDER: &str = "$ARGUMENTS";

static SKILL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{1,48}[A-Za-z0-9]$").expect("valid skill name regex"));

/// Interpreter for shell-mode skills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    Bash,
    Python,
}

impl Interpreter {
    /// Program invoked with the script path
    pub fn program(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Python => "python3",
        }
    }

    /// Language tag of the fenced block in SKILL.md
    pub fn fence(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Python => "python",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Bash => "sh",
            Self::Python => "py",
        }
    }

    /// Map an `execution_mode` value to a shell interpreter
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode.trim().to_lowercase().as_str() {
            "bash" | "sh" | "shell" => Some(Self::Bash),
            "python" | "python3" => Some(Self::Python),
            _ => None,
        }
    }
}

/// How a skill produces its answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run a script under the sandbox identity
    Shell {
        interpreter: Interpreter,
        timeout_secs: u64,
        script: String,
        /// Forward stdout to a generation backend instead of returning it
        wrap: bool,
    },
    /// Substitute the input into an instruction template and generate
    GenerationWrapped { template: String },
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell { .. } => "shell",
            Self::GenerationWrapped { .. } => "generation-wrapped",
        }
    }
}

/// A loaded skill. Immutable once built; shared as `Arc<SkillDefinition>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    /// Trigger phrases in declaration order
    pub triggers: Vec<String>,
    pub mode: ExecutionMode,
    pub source_path: PathBuf,
}

impl SkillDefinition {
    /// Validate name, metadata and mode-specific fields
    pub fn validate(&self) -> Result<(), SkillError> {
        validate_name(&self.name)?;

        if self.description.trim().is_empty() {
            return Err(SkillError::MissingField("description".to_string()));
        }
        if self.triggers.is_empty() {
            return Err(SkillError::MissingField("triggers".to_string()));
        }
        if self.triggers.iter().any(|t| t.trim().is_empty()) {
            return Err(SkillError::InvalidField {
                field: "triggers".to_string(),
                reason: "empty trigger phrase".to_string(),
            });
        }

        match &self.mode {
            ExecutionMode::Shell {
                timeout_secs, script, ..
            } => {
                if *timeout_secs == 0 || *timeout_secs > MAX_TIMEOUT_SECS {
                    return Err(SkillError::InvalidField {
                        field: "timeout".to_string(),
                        reason: format!("must be between 1 and {} seconds", MAX_TIMEOUT_SECS),
                    });
                }
                if script.trim().is_empty() {
                    return Err(SkillError::MissingField("script".to_string()));
                }
            }
            ExecutionMode::GenerationWrapped { template } => {
                if template.trim().is_empty() {
                    return Err(SkillError::MissingField("instructions".to_string()));
                }
                if template.matches(ARGUMENTS_PLACEHOLDER).count() > 1 {
                    return Err(SkillError::InvalidField {
                        field: "instructions".to_string(),
                        reason: format!("more than one {} placeholder", ARGUMENTS_PLACEHOLDER),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        match &self.mode {
            ExecutionMode::Shell { timeout_secs, .. } => Some(Duration::from_secs(*timeout_secs)),
            ExecutionMode::GenerationWrapped { .. } => None,
        }
    }

    pub fn is_shell(&self) -> bool {
        matches!(self.mode, ExecutionMode::Shell { .. })
    }
}

/// Reject names outside the allowed pattern. Separators, dots and absolute
/// paths can never match it.
pub fn validate_name(name: &str) -> Result<(), SkillError> {
    if SKILL_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SkillError::InvalidName(name.to_string()))
    }
}

/// Resolve `<root>/<name>/SKILL.md`, refusing anything that would land
/// outside `root` (bad names, `..`, or a symlinked skill directory).
pub fn contained_skill_path(root: &Path, name: &str) -> Result<PathBuf, SkillError> {
    validate_name(name)?;

    let root = root
        .canonicalize()
        .map_err(|e| SkillError::Io(format!("registry root {}: {}", root.display(), e)))?;
    let dir = root.join(name);

    if dir
        .components()
        .skip(root.components().count())
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(SkillError::Traversal(name.to_string()));
    }

    if dir.exists() {
        let resolved = dir
            .canonicalize()
            .map_err(|e| SkillError::Io(format!("{}: {}", dir.display(), e)))?;
        if !resolved.starts_with(&root) {
            return Err(SkillError::Traversal(name.to_string()));
        }
    }

    Ok(dir.join(SKILL_FILE))
}

/// Skill loading and validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkillError {
    #[error("invalid skill name: {0}")]
    InvalidName(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("path escapes the skills root: {0}")]
    Traversal(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("skill already exists: {0}")]
    NameCollision(String),

    #[error("io error: {0}")]
    Io(String),
}
