//! Shared fakes for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use securebot::backends::{Classification, Classifier, GenerationError, Generator, Retriever};
use securebot::escalation::{SandboxReport, SandboxTester};
use securebot::router::Intent;
use securebot::skills::{Interpreter, PrivilegeDrop, RawOutput, SandboxConfig, SandboxError, SkillExecutor};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DISK_USAGE_SKILL: &str = "---\nname: disk-usage\ndescription: Show disk usage\ntriggers:\n  - disk usage\nexecution_mode: bash\ntimeout: 10\n---\n\n```bash\ndf -h /\n```\n";

pub const DATETIME_SKILL: &str = "---\nname: datetime-now\ndescription: Current date and time\ntriggers:\n  - what time is it\n  - current time\nexecution_mode: bash\ntimeout: 10\n---\n\n```bash\ndate '+%H:%M'\n```\n";

/// Write `<root>/<dir>/SKILL.md`
pub fn write_skill(root: &Path, dir: &str, content: &str) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("SKILL.md"), content).unwrap();
}

/// Generator that replays a script of replies, then repeats its default
pub struct ScriptedGenerator {
    name: String,
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    default: Result<String, GenerationError>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(name: &str, default: Result<String, GenerationError>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            replies: Mutex::new(VecDeque::new()),
            default,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn answering(name: &str, reply: &str) -> Arc<Self> {
        Self::new(name, Ok(reply.to_string()))
    }

    pub fn unreachable(name: &str) -> Arc<Self> {
        Self::new(name, Err(GenerationError::Unavailable("connection refused".to_string())))
    }

    /// Queue `reply` ahead of the default and of anything queued later
    pub fn first(self: Arc<Self>, reply: Result<String, GenerationError>) -> Arc<Self> {
        self.replies.lock().push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_with_system(&self, prompt: &str, _system: &str) -> Result<String, GenerationError> {
        self.prompts.lock().push(prompt.to_string());
        let next = self.replies.lock().pop_front();
        next.unwrap_or_else(|| self.default.clone())
    }
}

#[derive(Default)]
pub struct CountingRetriever {
    calls: AtomicUsize,
}

impl CountingRetriever {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Retriever for CountingRetriever {
    async fn retrieve(&self, _query: &str, _user_id: &str, _max_tokens: usize) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        "The user's cat is called Miso.".to_string()
    }
}

pub struct FixedClassifier(pub Result<Classification, GenerationError>);

impl FixedClassifier {
    pub fn new(intent: Intent, confidence: f32) -> Arc<Self> {
        Arc::new(Self(Ok(Classification { intent, confidence })))
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self(Err(GenerationError::Unavailable("classifier offline".to_string()))))
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification, GenerationError> {
        self.0.clone()
    }
}

/// Stands in for the sudo boundary; records each script it was handed
pub struct FakeDrop {
    output: RawOutput,
    pub scripts: Mutex<Vec<String>>,
}

impl FakeDrop {
    pub fn printing(stdout: &str) -> Arc<Self> {
        Self::with_output(RawOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Default::default()
        })
    }

    pub fn timing_out() -> Arc<Self> {
        Self::with_output(RawOutput {
            timed_out: true,
            ..Default::default()
        })
    }

    pub fn with_output(output: RawOutput) -> Arc<Self> {
        Arc::new(Self {
            output,
            scripts: Mutex::new(Vec::new()),
        })
    }

    pub fn runs(&self) -> usize {
        self.scripts.lock().len()
    }
}

#[async_trait]
impl PrivilegeDrop for FakeDrop {
    async fn run(&self, script: &Path, _: Interpreter, _: Duration) -> Result<RawOutput, SandboxError> {
        let content = std::fs::read_to_string(script).map_err(|e| SandboxError::Io(e.to_string()))?;
        self.scripts.lock().push(content);
        Ok(self.output.clone())
    }
}

/// Sandbox tester with a fixed verdict
pub struct FakeTester {
    report: SandboxReport,
    calls: AtomicUsize,
}

impl FakeTester {
    pub fn passing() -> Arc<Self> {
        Self::reporting(SandboxReport {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
        })
    }

    pub fn failing(stderr: &str) -> Arc<Self> {
        Self::reporting(SandboxReport {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
            timed_out: false,
        })
    }

    fn reporting(report: SandboxReport) -> Arc<Self> {
        Arc::new(Self {
            report,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxTester for FakeTester {
    async fn test(&self, _script: &str, _: Interpreter, _: Duration) -> Result<SandboxReport, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.report.clone())
    }
}

/// Executor over a fake sandbox, no OS user switch
pub fn executor(dropper: Arc<FakeDrop>, generator: Arc<dyn Generator>) -> Arc<SkillExecutor> {
    let config = SandboxConfig {
        sandbox_user: None,
        ..Default::default()
    };
    Arc::new(SkillExecutor::new(dropper, generator, &config))
}
