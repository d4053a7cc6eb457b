#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hlsd::launcher::{FixedStrategy, PipelineProcess, PipelineRequest, PipelineStage, PipelineTool};
use hlsd::{ContentFile, ContentResolver, Error, OrchestratorConfig, PipelineStrategy, ProgressSnapshot, Result, SessionOrchestrator};
use parking_lot::Mutex;

/// Resolver that never leaves the process.
#[derive(Default)]
pub struct FakeResolver {
    pub progress: Mutex<ProgressSnapshot>,
    pub start_bytes: Mutex<Vec<u64>>,
    pub files: Mutex<Vec<ContentFile>>,
}

impl FakeResolver {
    pub fn set_bytes_completed(&self, bytes: u64) {
        let mut progress = self.progress.lock();
        progress.info_hash = Some("abc123".to_string());
        progress.bytes_completed = bytes;
    }
}

#[async_trait]
impl ContentResolver for FakeResolver {
    fn stream_url(&self, locator: &str, index: u32, start_byte: u64) -> Result<String> {
        self.start_bytes.lock().push(start_byte);
        Ok(format!("http://content.test/stream?url={locator}&index={index}&start_byte={start_byte}"))
    }

    async fn fetch_progress(&self, _locator: &str) -> Result<ProgressSnapshot> {
        Ok(self.progress.lock().clone())
    }

    async fn list_files(&self, _locator: &str) -> Result<Vec<ContentFile>> {
        Ok(self.files.lock().clone())
    }
}

/// Pipeline tool running a shell script in the session directory.
pub struct ShellTool {
    pub script: Mutex<String>,
    pub fail: Mutex<bool>,
    pub requests: Mutex<Vec<PipelineRequest>>,
}

impl ShellTool {
    pub fn sleeping() -> Self {
        Self {
            script: Mutex::new("exec sleep 30".to_string()),
            fail: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: &str) {
        *self.script.lock() = script.to_string();
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn last_request(&self) -> Option<PipelineRequest> {
        self.requests.lock().last().cloned()
    }
}

impl PipelineTool for ShellTool {
    fn spawn(&self, request: &PipelineRequest) -> Result<PipelineProcess> {
        self.requests.lock().push(request.clone());
        if *self.fail.lock() {
            return Err(Error::launch_failure(&request.session_id, "tool unavailable"));
        }
        let mut command = process_utils::tokio_command("sh");
        command
            .arg("-c")
            .arg(self.script.lock().as_str())
            .current_dir(&request.working_dir);
        PipelineProcess::spawn_chain(&request.session_id, vec![PipelineStage::new("sh", command)])
    }
}

pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub resolver: Arc<FakeResolver>,
    pub tool: Arc<ShellTool>,
}

pub fn config(dir: &Path, cap: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        streams_base_dir: dir.to_path_buf(),
        max_concurrent_sessions: cap,
        progress_poll_interval_ms: 20,
        progress_backoff_interval_ms: 40,
        progress_fetch_timeout_ms: 500,
        stop_grace_period_ms: 2000,
        ..Default::default()
    }
}

pub fn harness(dir: &Path, cap: usize) -> Harness {
    harness_with(config(dir, cap))
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let resolver = Arc::new(FakeResolver::default());
    let tool = Arc::new(ShellTool::sleeping());
    let orchestrator = SessionOrchestrator::new(
        config,
        resolver.clone(),
        tool.clone(),
        Arc::new(FixedStrategy(PipelineStrategy::Remux)),
    )
    .unwrap();
    Harness {
        orchestrator,
        resolver,
        tool,
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
