//! Skills System
//!
//! Pre-authored automation loaded from `<root>/<name>/SKILL.md`.
//!
//! # Architecture
//!
//! ```text
//! SKILL.md files ─→ loader ─→ Snapshot (skills + TriggerIndex) ─→ SkillRegistry
//!                                                                     │
//!              query ─→ find_by_trigger ─→ SkillDefinition ─→ SkillExecutor
//!                                                              │         │
//!                                                      shell (sandbox)   generation-wrapped
//! ```
//!
//! # Security
//!
//! - Skill names are validated against a strict pattern and every resolved
//!   path must stay under the registry root
//! - Shell payloads run as a separate OS identity through one narrow
//!   [`PrivilegeDrop`] seam, with a cleared environment and a hard timeout
//! - User input for generation-wrapped skills is truncated, stripped of
//!   prompt-boundary tokens and confined between sentinel markers

pub mod loader;
pub mod registry;
pub mod sandbox;
pub mod sanitize;
pub mod types;

pub use loader::{load_dir, parse_skill, render_skill, LoadReport, Rejected};
pub use registry::{ReloadSummary, SkillRegistry, Snapshot, TriggerIndex};
pub use sandbox::{
    lint_script, ExecutionRequest, ExecutionResult, ExecutionStatus, LintReport, PrivilegeDrop, RawOutput,
    SandboxConfig, SandboxError, SkillExecutor, SudoDrop,
};
pub use sanitize::{render_template, sanitize_arguments, RenderedPrompt, SanitizedInput};
pub use types::{
    contained_skill_path, validate_name, ExecutionMode, Interpreter, SkillDefinition, SkillError, MAX_TIMEOUT_SECS,
    SKILL_FILE,
};
