//! Fake process runner and download strategy.

use crate::errors::{FetchError, ProcessError};
use crate::fetch::{FetchStrategy, FetchTask};
use crate::process::{ChildHandle, CommandOutput, CommandRunner, CommandSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A runner that records commands and answers from a script.
///
/// Unscripted programs succeed with empty output. Spawned children run
/// until killed.
#[derive(Debug, Default)]
pub struct FakeRunner {
    tools: Mutex<HashSet<String>>,
    sticky: Mutex<HashMap<String, CommandOutput>>,
    queued: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    spawn_failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<CommandSpec>>,
    spawned: Mutex<Vec<CommandSpec>>,
    next_pid: AtomicU32,
}

impl FakeRunner {
    /// Creates a runner with no installed tools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `program` as installed.
    #[must_use]
    pub fn with_tool(self, program: &str) -> Self {
        self.tools.lock().insert(program.to_string());
        self
    }

    /// Answers every later run of `program` with `output`.
    pub fn respond(&self, program: &str, output: CommandOutput) {
        self.queued.lock().remove(program);
        self.sticky.lock().insert(program.to_string(), output);
    }

    /// Answers the next run of `program` with `output`, before any sticky answer.
    pub fn enqueue(&self, program: &str, output: CommandOutput) {
        self.queued
            .lock()
            .entry(program.to_string())
            .or_default()
            .push_back(output);
    }

    /// Makes spawning `program` fail.
    pub fn fail_spawn(&self, program: &str) {
        self.spawn_failures.lock().insert(program.to_string());
    }

    /// Every run, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Number of runs of `program`.
    #[must_use]
    pub fn calls_to(&self, program: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.program == program).count()
    }

    /// Every spawn, in order.
    #[must_use]
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.spawned.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.calls.lock().push(spec.clone());
        let queued = self
            .queued
            .lock()
            .get_mut(&spec.program)
            .and_then(VecDeque::pop_front);
        Ok(queued
            .or_else(|| self.sticky.lock().get(&spec.program).cloned())
            .unwrap_or_else(|| CommandOutput::success("")))
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildHandle>, ProcessError> {
        if self.spawn_failures.lock().contains(&spec.program) {
            return Err(ProcessError::Spawn {
                program: spec.program.clone(),
                reason: "scripted spawn failure".to_string(),
            });
        }
        self.spawned.lock().push(spec.clone());
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChild { pid: Some(pid) }))
    }

    fn is_available(&self, program: &str) -> bool {
        self.tools.lock().contains(program)
    }
}

struct FakeChild {
    pid: Option<u32>,
}

#[async_trait]
impl ChildHandle for FakeChild {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.pid = None;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Write(Vec<u8>),
    Fail,
    Silent,
}

/// A download strategy with a fixed behavior.
///
/// Clones share the call counter.
#[derive(Debug, Clone)]
pub struct StaticStrategy {
    name: String,
    available: bool,
    behavior: Behavior,
    partial: Option<Vec<u8>>,
    calls: Arc<AtomicUsize>,
}

impl StaticStrategy {
    fn new(name: &str, available: bool, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            available,
            behavior,
            partial: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A strategy whose tool is not installed.
    #[must_use]
    pub fn unavailable(name: &str) -> Self {
        Self::new(name, false, Behavior::Fail)
    }

    /// Writes `bytes` to the destination and succeeds.
    #[must_use]
    pub fn writing(name: &str, bytes: &[u8]) -> Self {
        Self::new(name, true, Behavior::Write(bytes.to_vec()))
    }

    /// Fails every time.
    #[must_use]
    pub fn failing(name: &str) -> Self {
        Self::new(name, true, Behavior::Fail)
    }

    /// Reports success without writing anything.
    #[must_use]
    pub fn silent(name: &str) -> Self {
        Self::new(name, true, Behavior::Silent)
    }

    /// Leaves `bytes` behind before failing.
    #[must_use]
    pub fn leaving_partial(mut self, bytes: &[u8]) -> Self {
        self.partial = Some(bytes.to_vec());
        self
    }

    /// Number of fetches attempted.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchStrategy for StaticStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn fetch(&self, task: &FetchTask) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = |reason: String| FetchError::StrategyFailed {
            uri: task.uri.clone(),
            strategy: self.name.clone(),
            reason,
        };

        match &self.behavior {
            Behavior::Write(bytes) => tokio::fs::write(&task.destination, bytes)
                .await
                .map_err(|e| failed(e.to_string())),
            Behavior::Silent => Ok(()),
            Behavior::Fail => {
                if let Some(partial) = &self.partial {
                    tokio::fs::write(&task.destination, partial)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                }
                Err(failed("scripted failure".to_string()))
            }
        }
    }
}
