//! Runs one sandboxed program and brokers its command stream.
//!
//! The program is launched through the rlimit wrapper in its own process
//! group. Each stdout line is a command, dispatched concurrently to the
//! resource registry; replies are written back to stdin one line each.
//! stderr is forwarded to the host log. Too much output, the wall-clock
//! timeout, or a fatal dispatch condition kill the whole process group.

use std::ops::ControlFlow;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sandbox::{ResourceCatalog, ResourceRegistry, RlimitScript, SandboxApi};
use sandbox_proto::{Command, LineDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Level, debug, info, warn};

use crate::api::WorkerApi;
use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::process::kill_process_group;

const READ_CHUNK: usize = 8192;

pub struct Worker {
    config: RunnerConfig,
    registry: ResourceRegistry,
}

impl Worker {
    pub fn new(config: RunnerConfig, registry: ResourceRegistry) -> Self {
        Self { config, registry }
    }

    /// Build the resources the config names from `catalog`.
    pub fn from_catalog(config: RunnerConfig, catalog: &ResourceCatalog) -> RunnerResult<Self> {
        let registry = ResourceRegistry::validate(catalog, &config.sandbox)?;
        Ok(Self::new(config, registry))
    }

    /// Set up resources, run the sandbox to completion, tear resources down.
    ///
    /// Returns the program's exit code, or `None` if it was killed.
    pub async fn run(self, initial: Option<Command>) -> RunnerResult<Option<i32>> {
        let Self {
            config,
            mut registry,
        } = self;
        registry.setup_resources().await?;

        let api = Arc::new(WorkerApi::new(&config.sandbox_id));
        let registry = Arc::new(registry);
        let result = supervise(&config, registry.clone(), api, initial).await;

        let mut registry = Arc::try_unwrap(registry).map_err(|_| {
            RunnerError::Internal("resource registry still shared after sandbox exit".into())
        })?;
        let teardown = registry.teardown_resources().await;
        let exit_code = result?;
        teardown?;
        Ok(exit_code)
    }
}

fn spawn(config: &RunnerConfig) -> RunnerResult<Child> {
    let mut target = vec![config.executable.to_string_lossy().into_owned()];
    target.extend(config.args.iter().cloned());
    let argv = RlimitScript::new(config.rlimits.clone(), target).build_args();
    let Some((program, args)) = argv.split_first() else {
        return Err(RunnerError::Internal("empty sandbox command line".into()));
    };

    let mut command = tokio::process::Command::new(program);
    command.args(args).env_clear();
    if !config.env.contains_key("PATH")
        && let Some(path) = std::env::var_os("PATH")
    {
        command.env("PATH", path);
    }
    command
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(dir) = &config.path {
        command.current_dir(dir);
    }

    info!(
        sandbox_id = %config.sandbox_id,
        executable = %config.executable.display(),
        "launching sandbox"
    );
    Ok(command.spawn()?)
}

async fn supervise(
    config: &RunnerConfig,
    registry: Arc<ResourceRegistry>,
    api: Arc<WorkerApi>,
    initial: Option<Command>,
) -> RunnerResult<Option<i32>> {
    let mut child = spawn(config)?;
    let pgid = child.id();
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        kill_process_group(pgid);
        return Err(RunnerError::Internal("sandbox stdio not piped".into()));
    };

    let (replies, outgoing) = mpsc::unbounded_channel();
    if let Some(command) = initial {
        let _ = replies.send(command);
    }
    let writer = tokio::spawn(write_commands(stdin, outgoing));

    let limit = RecvLimit::new(config.recv_limit, api.clone());
    let dispatcher = Dispatcher::new(registry, api.clone(), replies);
    let stdout_task = tokio::spawn(read_commands(stdout, dispatcher, limit.clone()));
    let stderr_task = tokio::spawn(read_stderr(stderr, api.clone(), limit));

    let timeout = Duration::from_secs(config.timeout);
    let exited = tokio::select! {
        status = child.wait() => Some(status?),
        () = api.killed() => None,
        () = tokio::time::sleep(timeout) => {
            api.log(
                Level::ERROR,
                &format!(
                    "Sandbox '{}' killed for exceeding its {}s timeout.",
                    api.sandbox_id(),
                    config.timeout
                ),
            );
            api.kill();
            None
        }
    };
    // Also reaps anything the program left running in its group.
    kill_process_group(pgid);
    let status = match exited {
        Some(status) => status,
        None => child.wait().await?,
    };

    for (task, stream) in [(stdout_task, "stdout"), (stderr_task, "stderr")] {
        if let Err(e) = task.await {
            warn!(sandbox_id = %api.sandbox_id(), stream, error = %e, "sandbox reader failed");
        }
    }
    if let Err(e) = writer.await {
        warn!(sandbox_id = %api.sandbox_id(), error = %e, "sandbox writer failed");
    }

    if api.is_killed() {
        info!(sandbox_id = %api.sandbox_id(), "sandbox killed");
        return Ok(None);
    }
    info!(sandbox_id = %api.sandbox_id(), code = ?status.code(), "sandbox exited");
    Ok(status.code())
}

/// Shared budget for everything read from the sandbox.
#[derive(Clone)]
struct RecvLimit {
    received: Arc<AtomicUsize>,
    limit: usize,
    api: Arc<WorkerApi>,
}

impl RecvLimit {
    fn new(limit: usize, api: Arc<WorkerApi>) -> Self {
        Self {
            received: Arc::new(AtomicUsize::new(0)),
            limit,
            api,
        }
    }

    /// Count `n` more bytes. Returns `false` once the budget is spent; the
    /// read that crosses it kills the sandbox.
    fn accept(&self, n: usize) -> bool {
        let before = self.received.fetch_add(n, Ordering::SeqCst);
        let total = before.saturating_add(n);
        if total <= self.limit {
            return true;
        }
        if before <= self.limit {
            self.api.log(
                Level::ERROR,
                &format!(
                    "Sandbox '{}' killed for producing too much data on stderr and stdout.",
                    self.api.sandbox_id()
                ),
            );
            self.api.kill();
        }
        false
    }
}

/// Read `reader` to EOF in chunks, charging each chunk to `limit`.
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: &RecvLimit,
    mut on_chunk: impl FnMut(&[u8]) -> ControlFlow<()>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "sandbox pipe read failed");
                break;
            }
        };
        if !limit.accept(n) {
            break;
        }
        let Some(chunk) = buf.get(..n) else {
            break;
        };
        if on_chunk(chunk).is_break() {
            break;
        }
    }
}

/// Turns stdout lines into dispatched commands.
struct Dispatcher {
    registry: Arc<ResourceRegistry>,
    api: Arc<WorkerApi>,
    replies: mpsc::UnboundedSender<Command>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    fn new(
        registry: Arc<ResourceRegistry>,
        api: Arc<WorkerApi>,
        replies: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            registry,
            api,
            replies,
            tasks: JoinSet::new(),
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        if self.api.is_killed() {
            return;
        }
        let command = match sandbox_proto::decode(line) {
            Ok(command) => command,
            Err(e) => {
                self.kill_for(&e.to_string());
                return;
            }
        };
        if command.reply {
            debug!(sandbox_id = %self.api.sandbox_id(), cmd = %command.cmd, "ignoring reply from sandbox");
            return;
        }
        let registry = self.registry.clone();
        let api = self.api.clone();
        let replies = self.replies.clone();
        self.tasks.spawn(async move {
            if let Some(reply) = registry.dispatch(&*api, &command).await {
                let _ = replies.send(reply);
            }
        });
    }

    fn kill_for(&self, reason: &str) {
        self.api.log(
            Level::ERROR,
            &format!(
                "Sandbox '{}' sent an invalid command: {reason}. Killing sandbox.",
                self.api.sandbox_id()
            ),
        );
        self.api.kill();
    }

    /// Wait for every in-flight dispatch.
    async fn finish(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(sandbox_id = %self.api.sandbox_id(), error = %e, "dispatch task failed");
            }
        }
    }
}

async fn read_commands<R: AsyncRead + Unpin>(
    stdout: R,
    mut dispatcher: Dispatcher,
    limit: RecvLimit,
) {
    let mut decoder = LineDecoder::new();
    pump(stdout, &limit, |chunk| match decoder.decode(chunk) {
        Ok(lines) => {
            for line in &lines {
                dispatcher.handle_line(line);
            }
            ControlFlow::Continue(())
        }
        Err(e) => {
            dispatcher.kill_for(&e.to_string());
            ControlFlow::Break(())
        }
    })
    .await;
    if let Some(line) = decoder.finish() {
        dispatcher.handle_line(&line);
    }
    dispatcher.finish().await;
}

async fn read_stderr<R: AsyncRead + Unpin>(stderr: R, api: Arc<WorkerApi>, limit: RecvLimit) {
    let mut decoder = LineDecoder::new();
    let log_line = |line: &[u8]| api.log(Level::ERROR, &String::from_utf8_lossy(line));
    pump(stderr, &limit, |chunk| {
        match decoder.decode(chunk) {
            Ok(lines) => lines.iter().for_each(|line| log_line(line.as_slice())),
            Err(e) => warn!(sandbox_id = %api.sandbox_id(), error = %e, "dropping stderr output"),
        }
        ControlFlow::Continue(())
    })
    .await;
    if let Some(line) = decoder.finish() {
        log_line(&line);
    }
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = stdin.write_all(&sandbox_proto::encode_line(&command)).await {
            debug!(error = %e, "sandbox stdin closed");
            break;
        }
    }
}
