//! Sandbox testing of draft scripts
//!
//! Drafts go through the gateway's own `/internal/test-skill` endpoint with a
//! signed request, so they run under exactly the isolation a committed skill
//! gets.

use crate::auth::SignedClient;
use crate::backends::GenerationError;
use crate::skills::{ExecutionResult, ExecutionStatus, Interpreter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Path of the sandbox test endpoint
pub const TEST_SKILL_PATH: &str = "/internal/test-skill";

/// Request body for [`TEST_SKILL_PATH`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxTestRequest {
    pub code: String,
    /// `bash` or `python`
    pub execution_mode: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Result of a sandbox test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
}

impl SandboxReport {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Short reason for a failed run, fed back into the next draft
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return "sandbox test timed out".to_string();
        }
        let stderr: String = self.stderr.trim().chars().take(300).collect();
        match self.exit_code {
            Some(code) if stderr.is_empty() => format!("sandbox test exited with {}", code),
            Some(code) => format!("sandbox test exited with {}: {}", code, stderr),
            None => format!("sandbox test did not run: {}", stderr),
        }
    }
}

impl From<&ExecutionResult> for SandboxReport {
    fn from(result: &ExecutionResult) -> Self {
        let (exit_code, timed_out, reason) = match &result.status {
            ExecutionStatus::Succeeded => (Some(0), false, None),
            ExecutionStatus::Failed { exit_code, reason } => (*exit_code, false, Some(reason.as_str())),
            ExecutionStatus::TimedOut { .. } => (None, true, None),
        };
        let mut stderr = result.stderr.clone();
        if exit_code.is_none() && !timed_out {
            if let Some(reason) = reason {
                stderr = reason.to_string();
            }
        }
        Self {
            stdout: result.stdout.clone(),
            stderr,
            exit_code,
            timed_out,
        }
    }
}

/// Runs a draft script in the sandbox
#[async_trait]
pub trait SandboxTester: Send + Sync {
    async fn test(&self, script: &str, interpreter: Interpreter, timeout: Duration)
        -> Result<SandboxReport, GenerationError>;
}

/// [`SandboxTester`] calling the gateway's test endpoint over signed HTTP
pub struct HttpSandboxTester {
    client: SignedClient,
    url: String,
}

impl HttpSandboxTester {
    pub fn new(client: SignedClient, gateway_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", gateway_url.trim_end_matches('/'), TEST_SKILL_PATH),
        }
    }
}

#[async_trait]
impl SandboxTester for HttpSandboxTester {
    async fn test(
        &self,
        script: &str,
        interpreter: Interpreter,
        timeout: Duration,
    ) -> Result<SandboxReport, GenerationError> {
        let body = SandboxTestRequest {
            code: script.to_string(),
            execution_mode: interpreter.fence().to_string(),
            timeout: Some(timeout.as_secs()),
        };

        // Leave room for sandbox overhead on top of the script's own limit
        let deadline = timeout + Duration::from_secs(10);
        let response = self
            .client
            .post(&self.url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::from_reqwest(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, &text));
        }

        let report: SandboxReport = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        debug!(exit_code = ?report.exit_code, timed_out = report.timed_out, "Sandbox test finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_verdicts() {
        let ok = SandboxReport {
            stdout: "hi".into(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
        };
        assert!(ok.passed());

        let failed = SandboxReport {
            exit_code: Some(2),
            stderr: "command not found".into(),
            ..ok.clone()
        };
        assert!(!failed.passed());
        assert!(failed.failure_reason().contains("command not found"));

        let slow = SandboxReport {
            exit_code: None,
            timed_out: true,
            ..ok
        };
        assert!(!slow.passed());
        assert_eq!(slow.failure_reason(), "sandbox test timed out");
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::json!({ "code": "echo hi", "execution_mode": "bash" });
        let request: SandboxTestRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.execution_mode, "bash");
        assert!(request.timeout.is_none());
    }
}
