//! Environment adapter backed by a directory and child processes on this host.
//!
//! Each session gets its own root directory. Commands run through `sh -c`
//! with the accumulated environment variables; background processes write
//! combined output to a log file under `.sitecraft/logs/` so it can be read
//! back when they fail to come up. Background processes lead their own
//! process group so stopping one also stops whatever it spawned. Children are
//! killed when the adapter is dropped.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::environment::{
    Environment, ExposedPort, OutputCallback, OutputStream, ProcessHandle, redact_credentials,
};
use crate::errors::EnvironmentError;

const OUTPUT_TAIL_BYTES: usize = 4096;
const LOG_TAIL_LINES: usize = 200;
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct BackgroundProcess {
    child: Child,
    log_path: PathBuf,
}

pub struct LocalEnvironment {
    root: PathBuf,
    preview_url_template: String,
    vars: Mutex<HashMap<String, String>>,
    processes: tokio::sync::Mutex<HashMap<String, BackgroundProcess>>,
}

impl LocalEnvironment {
    /// Create the root directory if needed. `preview_url_template` may use
    /// `{port}`, `{hostname}` and `{token}`.
    pub fn new(root: impl Into<PathBuf>, preview_url_template: &str) -> Result<Self, EnvironmentError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            preview_url_template: preview_url_template.to_string(),
            vars: Mutex::new(HashMap::new()),
            processes: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Map a relative path into the root, rejecting anything that escapes it.
    fn resolve(&self, relative: &str) -> Result<PathBuf, EnvironmentError> {
        let path = Path::new(relative);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(EnvironmentError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn vars(&self) -> HashMap<String, String> {
        self.vars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// `ProcessExited` once the tracked child has terminated.
    async fn check_alive(&self, handle: &ProcessHandle) -> Result<(), EnvironmentError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(handle.id())
            .ok_or_else(|| EnvironmentError::UnknownProcess(handle.id().to_string()))?;
        match process.child.try_wait()? {
            Some(status) => Err(EnvironmentError::ProcessExited {
                code: status.code(),
            }),
            None => Ok(()),
        }
    }

    fn shell(&self, command: &str, dir: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(dir)
            .envs(self.vars())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

fn push_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    if tail.len() > OUTPUT_TAIL_BYTES {
        let mut cut = tail.len() - OUTPUT_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Read `reader` line by line (lossy UTF-8, newline kept) into `tx`.
async fn forward_output<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx
                    .send((stream, String::from_utf8_lossy(&buf).into_owned()))
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(stream = stream.as_str(), error = %e, "output stream closed");
                break;
            }
        }
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn set_env_vars(&self, vars: HashMap<String, String>) -> Result<(), EnvironmentError> {
        self.vars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(vars);
        Ok(())
    }

    async fn execute(
        &self,
        command: &str,
        working_dir: &str,
        on_output: OutputCallback<'_>,
    ) -> Result<(), EnvironmentError> {
        let dir = self.resolve(working_dir)?;
        tracing::debug!(working_dir = %dir.display(), "executing command");
        let mut child = self
            .shell(command, &dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut tail = String::new();
        while let Some((stream, text)) = rx.recv().await {
            push_tail(&mut tail, &text);
            on_output(stream, &text);
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(EnvironmentError::Execution {
                exit_code: status.code().unwrap_or(-1),
                last_output: tail,
            })
        }
    }

    async fn start_background_process(
        &self,
        command: &str,
        working_dir: &str,
    ) -> Result<ProcessHandle, EnvironmentError> {
        let dir = self.resolve(working_dir)?;
        let id = uuid::Uuid::new_v4().to_string();
        let log_dir = self.root.join(".sitecraft").join("logs");
        tokio::fs::create_dir_all(&log_dir).await?;
        let log_path = log_dir.join(format!("{}.log", id));
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = self.shell(command, &dir);
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd.spawn()?;
        tracing::info!(process_id = %id, pid = ?child.id(), "started background process");

        self.processes
            .lock()
            .await
            .insert(id.clone(), BackgroundProcess { child, log_path });
        Ok(ProcessHandle::new(id))
    }

    async fn ensure_port_free(&self, port: u16) -> Result<(), EnvironmentError> {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Err(EnvironmentError::PortInUse { port });
        }
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                drop(listener);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                Err(EnvironmentError::PortInUse { port })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for_port(
        &self,
        handle: &ProcessHandle,
        port: u16,
        timeout: Duration,
    ) -> Result<(), EnvironmentError> {
        let started = Instant::now();
        loop {
            self.check_alive(handle).await?;

            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                // A listener owned by someone else would answer too.
                self.check_alive(handle).await?;
                tracing::debug!(port, elapsed_ms = started.elapsed().as_millis() as u64, "port is accepting connections");
                return Ok(());
            }

            if started.elapsed() >= timeout {
                return Err(EnvironmentError::PortTimeout {
                    port,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }

    async fn stop_process(&self, handle: &ProcessHandle) -> Result<(), EnvironmentError> {
        let Some(mut process) = self.processes.lock().await.remove(handle.id()) else {
            return Ok(());
        };
        if process.child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = process.child.id() {
            let group = format!("-{}", pid);
            if let Err(e) = Command::new("kill")
                .args(["-TERM", "--", group.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
            {
                tracing::debug!(process_id = %handle.id(), error = %e, "could not signal process group");
            }
        }

        match process.child.kill().await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(process_id = %handle.id(), "stopped background process");
        Ok(())
    }

    async fn fetch_process_logs(&self, handle: &ProcessHandle) -> Result<String, EnvironmentError> {
        let log_path = {
            let processes = self.processes.lock().await;
            processes
                .get(handle.id())
                .map(|p| p.log_path.clone())
                .ok_or_else(|| EnvironmentError::UnknownProcess(handle.id().to_string()))?
        };
        let bytes = tokio::fs::read(&log_path).await?;
        Ok(last_lines(&String::from_utf8_lossy(&bytes), LOG_TAIL_LINES))
    }

    async fn expose_port(
        &self,
        port: u16,
        hostname: &str,
        access_token: &str,
    ) -> Result<ExposedPort, EnvironmentError> {
        let url = self
            .preview_url_template
            .replace("{port}", &port.to_string())
            .replace("{hostname}", hostname)
            .replace("{token}", access_token);
        Ok(ExposedPort { url })
    }

    async fn checkout_repository(&self, url: &str, target_dir: &str) -> Result<(), EnvironmentError> {
        let target = self.resolve(target_dir)?;
        if target == self.root {
            return Err(EnvironmentError::InvalidPath(target_dir.to_string()));
        }
        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_dir_all(&target).await?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(url = %redact_credentials(url), target = %target.display(), "cloning repository");
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--"])
            .arg(url)
            .arg(&target)
            .current_dir(&self.root)
            .envs(self.vars())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(EnvironmentError::Execution {
                exit_code: output.status.code().unwrap_or(-1),
                last_output: redact_credentials(stderr.trim()),
            })
        }
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, EnvironmentError> {
        let path = self.resolve(path)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EnvironmentError> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}
