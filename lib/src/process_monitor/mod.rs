//! Supervision of a target process running next to an execution agent.
//! The monitor keeps the last lines the target printed and records every exit, the harness
//! compares exit generations before and after a request to attribute a crash to it.
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

const TAIL_LINES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// 1 for the first exit, 2 for the second, ...
    pub generation: u64,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

#[derive(Debug, Default)]
struct MonitorState {
    exits: Vec<ExitReport>,
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

fn push_line(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn join_tail(tail: &VecDeque<String>) -> String {
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

#[derive(Debug, Clone, Default)]
pub struct TargetMonitor {
    state: Arc<Mutex<MonitorState>>,
    shutdown: CancellationToken,
}

impl TargetMonitor {
    /// A monitor without a process. Exits are reported by whoever supervises the target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the target process and monitor it. With `restart` the process is started
    /// again after every exit so the campaign can go on.
    pub async fn spawn(
        command: &str,
        args: &[String],
        restart: bool,
        startup_delay: Duration,
    ) -> color_eyre::Result<Self> {
        let monitor = Self::new();
        let child = monitor.start_child(command, args)?;
        debug!("Started target process {command}");
        // The target should be listening after this
        sleep(startup_delay).await;

        let supervisor = monitor.clone();
        let command = command.to_string();
        let args = args.to_vec();
        tokio::spawn(async move {
            let mut child = child;
            loop {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = supervisor.shutdown.cancelled() => {
                        let _ = child.kill().await;
                        break;
                    }
                };
                match status {
                    Ok(status) => {
                        let report = supervisor.record_status(status);
                        info!("Target process exited with status: {}", status);
                        info!("Last stderr: {:?}", report.stderr_tail);
                    }
                    Err(e) => {
                        error!("Lost track of the target process: {e}");
                        break;
                    }
                }
                if !restart || supervisor.shutdown.is_cancelled() {
                    break;
                }
                sleep(startup_delay).await;
                match supervisor.start_child(&command, &args) {
                    Ok(next) => {
                        info!("Restarted target process {command}");
                        child = next;
                        sleep(startup_delay).await;
                    }
                    Err(e) => {
                        error!("Could not restart target process {command}: {e}");
                        break;
                    }
                }
            }
        });
        Ok(monitor)
    }

    fn start_child(&self, command: &str, args: &[String]) -> color_eyre::Result<Child> {
        let mut child = Command::new(command)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(stdout) = child.stdout.take() {
            self.follow(stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            self.follow(stderr, true);
        }
        Ok(child)
    }

    fn follow(&self, stream: impl AsyncRead + Unpin + Send + 'static, is_stderr: bool) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("Target {}: {line}", if is_stderr { "stderr" } else { "stdout" });
                let mut state = state.lock().unwrap();
                if is_stderr {
                    push_line(&mut state.stderr, line);
                } else {
                    push_line(&mut state.stdout, line);
                }
            }
        });
    }

    fn record_status(&self, status: ExitStatus) -> ExitReport {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        self.record_exit(status.code(), signal)
    }

    /// Record an exit of the target. Used by the supervisor task and by external supervisors.
    pub fn record_exit(&self, code: Option<i32>, signal: Option<i32>) -> ExitReport {
        let mut state = self.state.lock().unwrap();
        let report = ExitReport {
            generation: state.exits.len() as u64 + 1,
            code,
            signal,
            stdout_tail: join_tail(&state.stdout),
            stderr_tail: join_tail(&state.stderr),
        };
        state.exits.push(report.clone());
        report
    }

    /// Append a line to the captured stderr, for supervisors that forward output themselves.
    pub fn record_stderr(&self, line: impl Into<String>) {
        push_line(&mut self.state.lock().unwrap().stderr, line.into());
    }

    /// Number of exits observed so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().exits.len() as u64
    }

    /// The first exit recorded after `generation`.
    pub fn exit_since(&self, generation: u64) -> Option<ExitReport> {
        self.state
            .lock()
            .unwrap()
            .exits
            .get(generation as usize)
            .cloned()
    }

    pub fn exits(&self) -> Vec<ExitReport> {
        self.state.lock().unwrap().exits.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
