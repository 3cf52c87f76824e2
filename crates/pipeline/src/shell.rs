//! Bundled [`JobRunner`] that executes definitions through a local shell.
//!
//! Freestyle jobs run their whole script as one step. Pipeline scripts are
//! parsed into stages that run in order; the branches of a `parallel` stage
//! run concurrently. Every stdout/stderr line is forwarded as an output
//! event and each stage is bracketed by start/finish events. A pipeline's
//! result maps stage names to their step results.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tumbler_core::definition::{Definition, DefinitionKind};

use crate::dsl::{self, Agent, Pipeline, Stage, Step};
use crate::runner::{JobRunner, RunContext, RunnerError, StageStatus};

/// Default interpreter used for `-c` invocations.
pub const DEFAULT_SHELL: &str = "sh";

/// Default container CLI for `docker` agents.
pub const DEFAULT_DOCKER: &str = "docker";

/// Output lines kept as a step's result. Every line is still published.
const RESULT_TAIL_LINES: usize = 20;

pub struct ShellRunner {
    shell: String,
    docker: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            docker: DEFAULT_DOCKER.into(),
        }
    }

    pub fn with_docker(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    fn program(&self, agent: &Agent) -> &str {
        match agent {
            Agent::Docker(_) => &self.docker,
            Agent::Any | Agent::None => &self.shell,
        }
    }

    fn command(&self, agent: &Agent, script: &str, ctx: &RunContext) -> Command {
        let mut command = Command::new(self.program(agent));
        if let Agent::Docker(image) = agent {
            command
                .args(["run", "--rm", "-e", "JOB_PATH", "-e", "WORKFLOW_ID"])
                .arg(image)
                .arg(&self.shell);
        }
        command
            .args(["-c", script])
            .env("JOB_PATH", ctx.job_path().as_str())
            .env("WORKFLOW_ID", ctx.workflow_id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the run future (cancel, timeout, fail-fast) kills the
            // step.
            .kill_on_drop(true);
        command
    }

    /// Run one shell script and return the tail of its output.
    async fn run_script(
        &self,
        agent: &Agent,
        script: &str,
        stage: Option<&str>,
        ctx: &RunContext,
    ) -> Result<String, RunnerError> {
        let mut child = self
            .command(agent, script, ctx)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: self.program(agent).to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Other("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Other("stderr not captured".into()))?;
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
        let (mut stdout_open, mut stderr_open) = (true, true);
        let mut tail = VecDeque::with_capacity(RESULT_TAIL_LINES);

        // Split on raw bytes: output that is not UTF-8 is decoded lossily
        // rather than failing the step.
        while stdout_open || stderr_open {
            let line = tokio::select! {
                read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                    stdout_open = read? > 0;
                    take_line(&mut stdout_buf)
                }
                read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                    stderr_open = read? > 0;
                    take_line(&mut stderr_buf)
                }
            };
            let Some(line) = line else { continue };

            if !ctx.emit_line(stage, line.as_str()) {
                return Err(RunnerError::Other("execution is no longer running".into()));
            }
            if tail.len() == RESULT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(RunnerError::StepFailed {
                step: script.to_string(),
                code: status.code(),
            });
        }
        Ok(Vec::from(tail).join("\n"))
    }

    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        ctx: &RunContext,
    ) -> Result<Value, RunnerError> {
        let mut results = Map::new();
        for stage in &pipeline.stages {
            let result = self.run_stage(stage, &pipeline.agent, ctx).await?;
            results.insert(stage.name.clone(), result);
        }
        Ok(Value::Object(results))
    }

    /// Run a stage between its start and finish events.
    ///
    /// Branches dropped by a fail-fast sibling never report a finish.
    fn run_stage<'a>(
        &'a self,
        stage: &'a Stage,
        inherited: &'a Agent,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value, RunnerError>> {
        async move {
            let agent = stage.agent.as_ref().unwrap_or(inherited);
            ctx.emit_stage(&stage.name, StageStatus::Started);

            let outcome = self.stage_body(stage, agent, ctx).await;

            let status = if outcome.is_ok() {
                StageStatus::Succeeded
            } else {
                StageStatus::Failed
            };
            ctx.emit_stage(&stage.name, status);
            outcome
        }
        .boxed()
    }

    /// Parallel branches first, then the stage's own steps.
    ///
    /// Result shape: the branch map, the step result array, or both under
    /// `parallel` and `steps`.
    async fn stage_body(
        &self,
        stage: &Stage,
        agent: &Agent,
        ctx: &RunContext,
    ) -> Result<Value, RunnerError> {
        let branches = if stage.parallel.is_empty() {
            None
        } else {
            Some(self.run_parallel(stage, agent, ctx).await?)
        };

        let mut steps = Vec::with_capacity(stage.steps.len());
        for step in &stage.steps {
            steps.push(self.run_step(step, agent, &stage.name, ctx).await?);
        }

        Ok(match branches {
            Some(branches) if steps.is_empty() => branches,
            Some(branches) => json!({ "parallel": branches, "steps": steps }),
            None => Value::Array(steps),
        })
    }

    async fn run_parallel(
        &self,
        stage: &Stage,
        agent: &Agent,
        ctx: &RunContext,
    ) -> Result<Value, RunnerError> {
        let branches = stage
            .parallel
            .iter()
            .map(|branch| self.run_stage(branch, agent, ctx));

        let results = if stage.fail_fast {
            // The first error drops the other branches, killing their steps.
            future::try_join_all(branches).await?
        } else {
            future::join_all(branches)
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Value::Object(
            stage
                .parallel
                .iter()
                .map(|branch| branch.name.clone())
                .zip(results)
                .collect(),
        ))
    }

    async fn run_step(
        &self,
        step: &Step,
        agent: &Agent,
        stage: &str,
        ctx: &RunContext,
    ) -> Result<Value, RunnerError> {
        let argument = step_argument(step)?;
        match step.command.as_str() {
            "sh" => {
                ctx.emit_line(Some(stage), format!("+ {argument}"));
                let output = self.run_script(agent, argument, Some(stage), ctx).await?;
                Ok(Value::String(output))
            }
            _ => {
                ctx.emit_line(Some(stage), argument);
                Ok(Value::String(argument.to_string()))
            }
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

#[async_trait]
impl JobRunner for ShellRunner {
    fn validate(&self, definition: &Definition) -> Result<(), RunnerError> {
        match definition.kind {
            DefinitionKind::Job => job_script(definition).map(drop),
            DefinitionKind::Pipeline => parse_runnable(&definition.script).map(drop),
        }
    }

    async fn run(
        &self,
        definition: Arc<Definition>,
        ctx: RunContext,
    ) -> Result<serde_json::Value, RunnerError> {
        match definition.kind {
            DefinitionKind::Job => {
                let script = job_script(&definition)?;
                tracing::debug!(
                    workflow_id = %ctx.workflow_id(),
                    path = %definition.path,
                    "Running job script",
                );
                ctx.emit_output(format!("+ {script}"));
                self.run_script(&Agent::Any, script, None, &ctx).await?;
                Ok(json!({ "steps": 1 }))
            }
            DefinitionKind::Pipeline => {
                let pipeline = parse_runnable(&definition.script)?;
                tracing::debug!(
                    workflow_id = %ctx.workflow_id(),
                    path = %definition.path,
                    stages = pipeline.stages.len(),
                    steps = pipeline.steps().len(),
                    "Running pipeline",
                );
                self.run_pipeline(&pipeline, &ctx).await
            }
        }
    }
}

fn job_script(definition: &Definition) -> Result<&str, RunnerError> {
    let script = definition.script.trim();
    if script.is_empty() {
        return Err(RunnerError::NoSteps(definition.path.to_string()));
    }
    Ok(script)
}

/// Parse a pipeline and check every step is one this runner supports.
fn parse_runnable(script: &str) -> Result<Pipeline, RunnerError> {
    let pipeline = dsl::parse_pipeline(script)?;
    for step in pipeline.steps() {
        step_argument(step)?;
    }
    Ok(pipeline)
}

/// The argument a supported step runs with.
fn step_argument(step: &Step) -> Result<&str, RunnerError> {
    let key = match step.command.as_str() {
        "sh" => "script",
        "echo" => "message",
        other => return Err(RunnerError::UnsupportedStep(other.to_string())),
    };
    step.argument(key)
        .ok_or_else(|| RunnerError::MissingArgument {
            step: step.command.clone(),
            argument: key,
        })
}

/// Drain a buffered line, dropping its terminator.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    if buf.is_empty() {
        return None;
    }
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(&['\n', '\r'][..])
        .to_string();
    buf.clear();
    Some(line)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
