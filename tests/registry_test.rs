//! Skill registry integration tests
//!
//! Loads real skills roots from temp dirs and runs matched skills through the
//! executor with a fake sandbox.

mod common;

use common::{executor, write_skill, FakeDrop, ScriptedGenerator, DATETIME_SKILL, DISK_USAGE_SKILL};
use securebot::skills::SkillRegistry;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_trigger_match_runs_skill_and_returns_stdout() {
    let root = TempDir::new().unwrap();
    write_skill(root.path(), "datetime-now", DATETIME_SKILL);

    let registry = SkillRegistry::open(root.path()).unwrap();
    let skill = registry.find_by_trigger("Hey, what time is it?").expect("trigger should match");
    assert_eq!(skill.name, "datetime-now");

    let dropper = FakeDrop::printing("14:05\n");
    let executor = executor(Arc::clone(&dropper), ScriptedGenerator::answering("local", "unused"));
    let result = executor.execute(skill, "Hey, what time is it?").await;

    assert!(result.succeeded());
    assert_eq!(result.answer().unwrap(), "14:05");
    assert_eq!(dropper.runs(), 1);
    assert!(dropper.scripts.lock()[0].contains("date '+%H:%M'"));
}

#[test]
fn test_invalid_files_are_rejected_without_affecting_valid_ones() {
    let root = TempDir::new().unwrap();
    write_skill(root.path(), "datetime-now", DATETIME_SKILL);
    write_skill(root.path(), "disk-usage", DISK_USAGE_SKILL);
    write_skill(
        root.path(),
        "Bad_Name",
        &DISK_USAGE_SKILL.replace("name: disk-usage", "name: Bad_Name"),
    );
    write_skill(root.path(), "mismatch", DATETIME_SKILL);
    write_skill(root.path(), "no-front-matter", "just some text\n");

    let registry = SkillRegistry::open(root.path()).unwrap();
    let snapshot = registry.snapshot();

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.rejected().len(), 3);
    assert!(registry.get("datetime-now").is_some());
    assert!(registry.get("disk-usage").is_some());
    assert!(registry.get("Bad_Name").is_none());
}

#[cfg(unix)]
#[test]
fn test_symlink_outside_root_is_rejected() {
    let outside = TempDir::new().unwrap();
    write_skill(outside.path(), "escape", &DATETIME_SKILL.replace("datetime-now", "escape"));

    let root = TempDir::new().unwrap();
    std::os::unix::fs::symlink(outside.path().join("escape"), root.path().join("escape")).unwrap();

    let snapshot = SkillRegistry::load(root.path()).unwrap();
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.rejected().len(), 1);
    assert!(snapshot.rejected()[0].reason.contains("escape"));
}

#[test]
fn test_reload_picks_up_new_skill() {
    let root = TempDir::new().unwrap();
    write_skill(root.path(), "datetime-now", DATETIME_SKILL);
    let registry = SkillRegistry::open(root.path()).unwrap();
    assert!(registry.find_by_trigger("show disk usage").is_none());

    let before = registry.snapshot();
    write_skill(root.path(), "disk-usage", DISK_USAGE_SKILL);
    let summary = registry.reload().unwrap();

    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.triggers, 3);
    assert_eq!(registry.find_by_trigger("show disk usage").unwrap().name, "disk-usage");
    // A snapshot taken earlier is unchanged
    assert_eq!(before.len(), 1);
}

#[test]
fn test_readers_never_see_a_partial_snapshot() {
    let root = TempDir::new().unwrap();
    write_skill(root.path(), "datetime-now", DATETIME_SKILL);
    let registry = Arc::new(SkillRegistry::open(root.path()).unwrap());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = registry.snapshot();
                    let skills = snapshot.len();
                    // Every loaded skill has its triggers indexed in the same snapshot
                    let expected_triggers: usize = snapshot.skills().iter().map(|s| s.triggers.len()).sum();
                    assert_eq!(snapshot.triggers().len(), expected_triggers);
                    assert!(skills == 1 || skills == 2);
                }
            })
        })
        .collect();

    write_skill(root.path(), "disk-usage", DISK_USAGE_SKILL);
    for _ in 0..20 {
        registry.reload().unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(registry.len(), 2);
}
