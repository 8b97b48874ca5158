//! Skill Loader
//!
//! Parses `<root>/<name>/SKILL.md` files: YAML front matter followed by either
//! a fenced script block (shell skills) or free-text instructions
//! (generation-wrapped skills).
//!
//! ```text
//! ---
//! name: datetime-now
//! description: Current date and time
//! triggers:
//!   - what time is it
//! execution_mode: bash
//! timeout: 10
//! ---
//! ```bash
//! date
//! ```
//! ```

use super::types::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

static FRONT_MATTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A\s*---\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n(.*))?\z").expect("valid front matter regex"));

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9]*)[ \t]*\r?\n(.*?)```").expect("valid fence regex"));

#[derive(Debug, Deserialize)]
struct FrontMatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    triggers: Vec<String>,
    execution_mode: Option<String>,
    timeout: Option<i64>,
    #[serde(default)]
    wrap: bool,
}

/// A file that failed to load, kept for diagnostics
#[derive(Debug, Clone)]
pub struct Rejected {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning a skills root
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Valid skills, sorted by name
    pub skills: Vec<SkillDefinition>,
    pub rejected: Vec<Rejected>,
}

/// Parse one SKILL.md body
pub fn parse_skill(content: &str, source_path: &Path) -> Result<SkillDefinition, SkillError> {
    let caps = FRONT_MATTER_RE
        .captures(content)
        .ok_or_else(|| SkillError::Parse("missing front matter".to_string()))?;
    let header = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let meta: FrontMatter = serde_yaml::from_str(header).map_err(|e| SkillError::Parse(e.to_string()))?;

    let name = meta
        .name
        .map(|n| n.trim().to_string())
        .ok_or_else(|| SkillError::MissingField("name".to_string()))?;
    validate_name(&name)?;

    let mode_str = meta
        .execution_mode
        .ok_or_else(|| SkillError::MissingField("execution_mode".to_string()))?;

    let mode = match Interpreter::from_mode(&mode_str) {
        Some(interpreter) => {
            let timeout = meta
                .timeout
                .ok_or_else(|| SkillError::MissingField("timeout".to_string()))?;
            if timeout <= 0 {
                return Err(SkillError::InvalidField {
                    field: "timeout".to_string(),
                    reason: "must be a positive number of seconds".to_string(),
                });
            }
            ExecutionMode::Shell {
                interpreter,
                timeout_secs: timeout as u64,
                script: extract_script(body, interpreter)?,
                wrap: meta.wrap,
            }
        }
        None => match mode_str.trim().to_lowercase().as_str() {
            "ollama" | "generation" | "generation-wrapped" => ExecutionMode::GenerationWrapped {
                template: body.trim().to_string(),
            },
            other => {
                return Err(SkillError::InvalidField {
                    field: "execution_mode".to_string(),
                    reason: format!("unknown mode '{}'", other),
                })
            }
        },
    };

    let skill = SkillDefinition {
        name,
        description: meta.description.unwrap_or_default().trim().to_string(),
        triggers: meta.triggers.iter().map(|t| t.trim().to_string()).collect(),
        mode,
        source_path: source_path.to_path_buf(),
    };
    skill.validate()?;
    Ok(skill)
}

/// First fenced block whose language tag fits the interpreter
fn extract_script(body: &str, interpreter: Interpreter) -> Result<String, SkillError> {
    let accepted: &[&str] = match interpreter {
        Interpreter::Bash => &["bash", "sh", "shell"],
        Interpreter::Python => &["python", "python3", "py"],
    };

    FENCE_RE
        .captures_iter(body)
        .find(|c| accepted.contains(&c[1].to_lowercase().as_str()))
        .map(|c| c[2].to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SkillError::MissingField(format!("```{} script block", interpreter.fence())))
}

/// Load every `<dir>/SKILL.md` under `root` in name order.
///
/// A file that fails to parse is logged and reported, never fatal. Only an
/// unreadable root is an error.
pub fn load_dir(root: &Path) -> Result<LoadReport, SkillError> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| SkillError::Io(format!("{}: {}", root.display(), e)))?;
    let entries =
        std::fs::read_dir(&canonical_root).map_err(|e| SkillError::Io(format!("{}: {}", root.display(), e)))?;

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut report = LoadReport::default();
    for dir in dirs {
        let path = dir.join(SKILL_FILE);
        if !path.is_file() {
            debug!(dir = %dir.display(), "No SKILL.md, skipping");
            continue;
        }

        match load_file(&canonical_root, &dir, &path) {
            Ok(skill) => {
                debug!(skill = %skill.name, mode = skill.mode.as_str(), "Loaded skill");
                report.skills.push(skill);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping invalid skill");
                report.rejected.push(Rejected {
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }

    report.skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(report)
}

fn load_file(root: &Path, dir: &Path, path: &Path) -> Result<SkillDefinition, SkillError> {
    let resolved = path
        .canonicalize()
        .map_err(|e| SkillError::Io(format!("{}: {}", path.display(), e)))?;
    if !resolved.starts_with(root) {
        return Err(SkillError::Traversal(path.display().to_string()));
    }

    let content = std::fs::read_to_string(&resolved).map_err(|e| SkillError::Io(e.to_string()))?;
    let skill = parse_skill(&content, &resolved)?;

    let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if dir_name != skill.name {
        return Err(SkillError::InvalidField {
            field: "name".to_string(),
            reason: format!("'{}' does not match directory '{}'", skill.name, dir_name),
        });
    }

    Ok(skill)
}

/// Render a definition back into the SKILL.md format
pub fn render_skill(skill: &SkillDefinition) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("name: {}\n", skill.name));
    out.push_str(&format!("description: {}\n", yaml_scalar(&skill.description)));
    out.push_str("triggers:\n");
    for trigger in &skill.triggers {
        out.push_str(&format!("  - {}\n", yaml_scalar(trigger)));
    }

    match &skill.mode {
        ExecutionMode::Shell {
            interpreter,
            timeout_secs,
            script,
            wrap,
        } => {
            out.push_str(&format!("execution_mode: {}\n", interpreter.fence()));
            out.push_str(&format!("timeout: {}\n", timeout_secs));
            if *wrap {
                out.push_str("wrap: true\n");
            }
            out.push_str("---\n\n");
            out.push_str(&format!("```{}\n{}", interpreter.fence(), script));
            if !script.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n");
        }
        ExecutionMode::GenerationWrapped { template } => {
            out.push_str("execution_mode: ollama\n");
            out.push_str("---\n\n");
            out.push_str(template);
            out.push('\n');
        }
    }
    out
}

fn yaml_scalar(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value.replace('"', "'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATETIME: &str = "---\nname: datetime-now\ndescription: Current date and time\ntriggers:\n  - what time is it\n  - current time\nexecution_mode: bash\ntimeout: 10\n---\n\nPrints the local time.\n\n```bash\ndate '+%H:%M'\n```\n";

    const SUMMARIZE: &str = "---\nname: summarize\ndescription: Summarize text\ntriggers: [summarize]\nexecution_mode: ollama\n---\nSummarize the following in three sentences:\n$ARGUMENTS\n";

    #[test]
    fn test_parse_shell_skill() {
        let skill = parse_skill(DATETIME, Path::new("datetime-now/SKILL.md")).unwrap();
        assert_eq!(skill.name, "datetime-now");
        assert_eq!(skill.triggers, vec!["what time is it", "current time"]);
        match skill.mode {
            ExecutionMode::Shell {
                interpreter,
                timeout_secs,
                script,
                wrap,
            } => {
                assert_eq!(interpreter, Interpreter::Bash);
                assert_eq!(timeout_secs, 10);
                assert_eq!(script, "date '+%H:%M'\n");
                assert!(!wrap);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_parse_generation_skill() {
        let skill = parse_skill(SUMMARIZE, Path::new("summarize/SKILL.md")).unwrap();
        assert_eq!(
            skill.mode,
            ExecutionMode::GenerationWrapped {
                template: "Summarize the following in three sentences:\n$ARGUMENTS".to_string()
            }
        );
        assert!(skill.timeout().is_none());
    }

    #[test]
    fn test_shell_skill_requires_timeout_and_fence() {
        let no_timeout = DATETIME.replace("timeout: 10\n", "");
        assert_eq!(
            parse_skill(&no_timeout, Path::new("x")),
            Err(SkillError::MissingField("timeout".to_string()))
        );

        let wrong_fence = DATETIME.replace("```bash", "```python");
        assert!(parse_skill(&wrong_fence, Path::new("x")).is_err());
    }

    #[test]
    fn test_rejects_bad_name_and_missing_front_matter() {
        let bad = DATETIME.replace("name: datetime-now", "name: ../etc");
        assert_eq!(
            parse_skill(&bad, Path::new("x")),
            Err(SkillError::InvalidName("../etc".to_string()))
        );
        assert!(parse_skill("just text", Path::new("x")).is_err());
    }

    #[test]
    fn test_render_round_trips_through_parser() {
        let skill = parse_skill(DATETIME, Path::new("datetime-now/SKILL.md")).unwrap();
        let reparsed = parse_skill(&render_skill(&skill), Path::new("datetime-now/SKILL.md")).unwrap();
        assert_eq!(skill, reparsed);
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let root = tempfile::tempdir().unwrap();
        let write = |dir: &str, content: &str| {
            std::fs::create_dir_all(root.path().join(dir)).unwrap();
            std::fs::write(root.path().join(dir).join(SKILL_FILE), content).unwrap();
        };
        write("summarize", SUMMARIZE);
        write("datetime-now", DATETIME);
        write("broken", "---\nname: [unclosed\n---\n");
        write("mismatch", &DATETIME.replace("name: datetime-now", "name: other-name"));

        let report = load_dir(root.path()).unwrap();
        let names: Vec<&str> = report.skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["datetime-now", "summarize"]);
        assert_eq!(report.rejected.len(), 2);
    }

    #[test]
    fn test_load_dir_missing_root() {
        assert!(load_dir(Path::new("/nonexistent/securebot/skills")).is_err());
    }
}
