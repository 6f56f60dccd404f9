//! Child process launcher.
//!
//! Spawns the record processor executable with piped stdio and binds a
//! [`ProtocolSession`] to its stdin/stdout. Child stderr is drained into
//! tracing so a chatty child cannot block on a full pipe.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use futures::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::bridge::codec::{DEFAULT_MAX_LINE_LENGTH, JsonLinesCodec};
use crate::bridge::protocol::InitializationInput;
use crate::bridge::transport::{FramedReader, QueuedWriter};
use crate::session::ProtocolSession;

/// Session bound to a spawned child's stdout and stdin.
pub type ChildSession = ProtocolSession<FramedReader<ChildStdout>, QueuedWriter>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub max_line_length: usize,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("child {0} was not captured")]
    MissingPipe(&'static str),
}

/// A running child process and the session that talks to it.
pub struct WorkerProcess {
    session: ChildSession,
    child: Child,
    stderr_drain: JoinHandle<()>,
}

impl WorkerProcess {
    pub fn session(&mut self) -> &mut ChildSession {
        &mut self.session
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Close the child's stdin and wait for it to exit.
    pub async fn wait(self) -> io::Result<ExitStatus> {
        let Self {
            session,
            mut child,
            stderr_drain,
        } = self;
        drop(session);
        let status = child.wait().await?;
        if let Err(e) = stderr_drain.await {
            tracing::warn!(error = %e, "Stderr drain task failed");
        }
        tracing::info!(%status, "Child process exited");
        Ok(status)
    }

    pub async fn kill(&mut self) -> io::Result<()> {
        tracing::warn!(pid = ?self.child.id(), "Killing child process");
        self.child.kill().await
    }
}

/// Spawn the child described by `config` for the shard in `input`.
///
/// Must be called inside a tokio runtime.
pub fn spawn_worker(
    config: &WorkerConfig,
    input: InitializationInput,
) -> Result<WorkerProcess, SpawnError> {
    tracing::info!(
        program = %config.program.display(),
        shard_id = %input.shard_id,
        "Spawning child process"
    );

    let mut child = config.command().spawn()?;
    let stdin: ChildStdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout: ChildStdout = child
        .stdout
        .take()
        .ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::MissingPipe("stderr"))?;

    let stderr_drain = tokio::spawn(drain_stderr(
        stderr,
        input.shard_id.clone(),
        config.max_line_length,
    ));

    let reader = FramedReader::with_codec(
        stdout,
        JsonLinesCodec::with_max_length(config.max_line_length),
    );
    let writer = QueuedWriter::with_codec(
        stdin,
        JsonLinesCodec::with_max_length(config.max_line_length),
    );

    tracing::debug!(pid = ?child.id(), shard_id = %input.shard_id, "Child process started");

    Ok(WorkerProcess {
        session: ProtocolSession::new(reader, writer, input),
        child,
        stderr_drain,
    })
}

async fn drain_stderr(stderr: ChildStderr, shard_id: String, max_line_length: usize) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(max_line_length));
    loop {
        let next = lines.next().await;
        match next {
            Some(Ok(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    tracing::info!(target: "multilang::child", %shard_id, "{}", trimmed);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(%shard_id, error = %e, "Failed to read child stderr, discarding the rest");
                let mut stderr = lines.into_inner();
                if let Err(e) = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await {
                    tracing::debug!(%shard_id, error = %e, "Stderr discard ended");
                }
                break;
            }
            None => break,
        }
    }
    tracing::trace!(%shard_id, "Stderr drain exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ShutdownReason;

    const CHILD_SCRIPT: &str = r#"
while read -r line; do
  case "$line" in
    *'"initialize"'*)
      echo "starting up" >&2
      echo '{"action":"status","responseFor":"initialize"}'
      ;;
    *'"process-records"'*)
      echo '{"action":"heartbeat"}'
      echo '{"action":"checkpoint","checkpoint":null}'
      read -r ack
      echo '{"action":"status","responseFor":"process-records"}'
      ;;
    *'"shutdown"'*)
      echo '{"action":"status","responseFor":"shutdown"}'
      exit 0
      ;;
  esac
done
"#;

    #[test]
    fn config_builder() {
        let config = WorkerConfig::new("python3")
            .with_arg("-u")
            .with_args(["processor.py", "--verbose"])
            .with_env("PYTHONUNBUFFERED", "1")
            .with_current_dir("/srv/app")
            .with_max_line_length(1024);

        assert_eq!(config.program, PathBuf::from("python3"));
        assert_eq!(config.args, vec!["-u", "processor.py", "--verbose"]);
        assert_eq!(
            config.env,
            vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]
        );
        assert_eq!(config.current_dir, Some(PathBuf::from("/srv/app")));
        assert_eq!(config.max_line_length, 1024);
    }

    #[test]
    fn config_defaults() {
        let config = WorkerConfig::new("processor");
        assert!(config.args.is_empty());
        assert!(config.current_dir.is_none());
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[tokio::test]
    async fn spawn_missing_program_fails() {
        let config = WorkerConfig::new("/nonexistent/multilang-test-processor");
        let result = spawn_worker(&config, InitializationInput::new("shardId-0"));
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drives_shell_child_through_lifecycle() {
        let config = WorkerConfig::new("sh").with_args(["-c", CHILD_SCRIPT]);
        let mut worker =
            spawn_worker(&config, InitializationInput::new("shardId-000000000001")).unwrap();
        assert!(worker.id().is_some());

        let session = worker.session();
        assert!(session.initialize().await);
        // No checkpointer: the child is told so and the round still completes.
        assert!(
            session
                .process_records(Default::default(), None)
                .await
        );
        assert!(session.shutdown(None, ShutdownReason::ShardEnd).await);

        let status = worker.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_fails_round() {
        let config = WorkerConfig::new("sh").with_args(["-c", "exit 0"]);
        let mut worker = spawn_worker(&config, InitializationInput::new("shardId-0")).unwrap();

        assert!(!worker.session().initialize().await);

        worker.kill().await.ok();
    }
}
