use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::domain::stage::StageError;

/// ジョブが起動した外部プロセスを追跡し、キャンセル時にまとめて強制終了する。
///
/// 子プロセスはそれぞれ自分のプロセスグループで起動されるため、
/// 孫プロセス（yt-dlp が起動する ffmpeg など）も同時に止まる。
#[derive(Debug, Clone, Default)]
pub struct ProcessTracker {
    pids: Arc<Mutex<HashSet<u32>>>,
    terminated: Arc<AtomicBool>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追跡を開始する。既に terminate 済みなら false を返す。
    fn track(&self, pid: u32) -> bool {
        let mut pids = self.pids.lock();
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        pids.insert(pid);
        true
    }

    fn untrack(&self, pid: u32) {
        self.pids.lock().remove(&pid);
    }

    pub fn active(&self) -> Vec<u32> {
        self.pids.lock().iter().copied().collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// 追跡中の全プロセスグループに SIGKILL を送り、以降の起動も拒否する
    pub fn terminate_all(&self) -> usize {
        let pids: Vec<u32> = {
            let mut pids = self.pids.lock();
            self.terminated.store(true, Ordering::SeqCst);
            pids.drain().collect()
        };
        pids.into_iter().filter(|pid| kill_process_group(*pid)).count()
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {
            log::debug!("Sent SIGKILL to process group {pid}");
            true
        }
        // 既に終了している
        Err(Errno::ESRCH) => {
            log::debug!("Process group {pid} already exited");
            false
        }
        Err(e) => {
            log::warn!("Failed to kill process group {pid}: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(pid: u32) -> bool {
    log::debug!("Process group kill not implemented for this platform (pid={pid})");
    false
}

/// 外部コマンドの起動パラメータ
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            current_dir: None,
            timeout,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// 外部コマンドを実行して出力を返す。
///
/// タイムアウト超過・非ゼロ終了はいずれも StageError。タスクが abort された場合は
/// `kill_on_drop` で直接の子が、`ProcessTracker::terminate_all` でグループ全体が止まる。
pub async fn run_command(
    spec: &CommandSpec,
    tracker: &ProcessTracker,
) -> Result<CommandOutput, StageError> {
    if tracker.is_terminated() {
        return Err(StageError::cancelled(format!(
            "Refusing to start {:?}: job was cancelled",
            spec.program
        )));
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    log::debug!("Running external tool: {:?} {:?}", spec.program, spec.args);

    let child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            StageError::external_tool(format!("Binary not found: {:?}", spec.program))
        }
        std::io::ErrorKind::PermissionDenied => {
            StageError::external_tool(format!("Cannot execute {:?}: {e}", spec.program))
        }
        _ => StageError::external_tool(format!("Failed to spawn {:?}: {e}", spec.program)),
    })?;

    let pid = child.id();
    if let Some(pid) = pid {
        if !tracker.track(pid) {
            kill_process_group(pid);
            return Err(StageError::cancelled(format!(
                "{:?} started after cancellation",
                spec.program
            )));
        }
    }

    let result = timeout(spec.timeout, child.wait_with_output()).await;
    if let Some(pid) = pid {
        tracker.untrack(pid);
    }

    let output = match result {
        Ok(output) => output.map_err(|e| {
            StageError::external_tool(format!("{:?} process error: {e}", spec.program))
        })?,
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            return Err(StageError::timeout(format!(
                "{:?} timed out after {}s",
                spec.program,
                spec.timeout.as_secs()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        if tracker.is_terminated() {
            return Err(StageError::cancelled(format!(
                "{:?} killed by cancellation",
                spec.program
            )));
        }
        let tail = stderr
            .char_indices()
            .rev()
            .nth(499)
            .map(|(i, _)| &stderr[i..])
            .unwrap_or(&stderr);
        return Err(StageError::external_tool(format!(
            "{:?} exited with status {}: {}",
            spec.program, output.status, tail
        )));
    }

    Ok(CommandOutput { stdout, stderr })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::stage::StageErrorKind;
    use std::time::Instant;

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn captures_stdout() {
        let tracker = ProcessTracker::new();
        let out = run_command(&sh("echo hello", Duration::from_secs(5)), &tracker)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(tracker.active().is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_external_tool_error() {
        let tracker = ProcessTracker::new();
        let err = run_command(&sh("echo oops >&2; exit 3", Duration::from_secs(5)), &tracker)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::ExternalTool);
        assert!(err.detail.contains("oops"));
    }

    #[tokio::test]
    async fn missing_binary() {
        let tracker = ProcessTracker::new();
        let spec = CommandSpec::new("/nonexistent/yt-dlp-xyz", vec![], Duration::from_secs(5));
        let err = run_command(&spec, &tracker).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::ExternalTool);
        assert!(err.detail.contains("not found"));
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let tracker = ProcessTracker::new();
        let started = Instant::now();
        let err = run_command(&sh("sleep 30", Duration::from_millis(200)), &tracker)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn terminate_all_kills_running_group() {
        let tracker = ProcessTracker::new();
        let spec = sh("sleep 30 & wait", Duration::from_secs(60));

        let runner = {
            let tracker = tracker.clone();
            tokio::spawn(async move { run_command(&spec, &tracker).await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while tracker.active().is_empty() {
            assert!(Instant::now() < deadline, "process never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(tracker.terminate_all(), 1);
        let err = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("process group survived SIGKILL")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn killing_a_reaped_group_is_not_counted() {
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        assert!(!kill_process_group(pid));
    }

    #[tokio::test]
    async fn refuses_to_start_after_termination() {
        let tracker = ProcessTracker::new();
        tracker.terminate_all();
        let err = run_command(&sh("echo never", Duration::from_secs(5)), &tracker)
            .await
            .unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Cancelled);
    }
}
