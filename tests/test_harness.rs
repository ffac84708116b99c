//! Shared helpers for the integration tests: in-process beacons on
//! ephemeral ports, throwaway worker scripts and a job driver.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cohort::beacon::BeaconServer;
use cohort::client::{JobOutcome, Submitter};
use cohort::config::{BeaconConfig, Timeouts};
use cohort::protocol::{Admission, MonitorEvent};
use cohort::scheduler::JobDescriptor;

/// Timeouts short enough that failure paths finish quickly in tests.
pub fn test_timeouts() -> Timeouts {
    Timeouts {
        probe: Duration::from_secs(1),
        handshake: Duration::from_secs(5),
        dispatch: Duration::from_secs(10),
        done: Duration::from_secs(2),
        kill_grace: Duration::from_millis(200),
        connect_attempts: 1,
        connect_retry_delay: Duration::from_millis(50),
    }
}

/// A beacon running inside the test process with its own scratch directory.
pub struct TestBeacon {
    pub server: BeaconServer,
    #[allow(dead_code)]
    dir: TempDir,
}

impl TestBeacon {
    pub async fn start(password: &str) -> Self {
        Self::start_with_timeouts(password, test_timeouts()).await
    }

    pub async fn start_with_timeouts(password: &str, timeouts: Timeouts) -> Self {
        let dir = TempDir::new().unwrap();
        let config = BeaconConfig::new(
            dir.path().join("beacon.sock"),
            "127.0.0.1:0".parse().unwrap(),
        )
        .with_password(password)
        .with_runtime_dir(dir.path().join("runtime"))
        .with_timeouts(timeouts);
        let server = BeaconServer::start(config).await.unwrap();
        Self { server, dir }
    }

    /// Host id other beacons dispatch to.
    #[allow(dead_code)]
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.server.listen_addr().port())
    }

    pub fn control_socket(&self) -> &Path {
        self.server.control_socket()
    }

    #[allow(dead_code)]
    pub async fn submitter(&self) -> Submitter {
        Submitter::connect(self.control_socket()).await.unwrap()
    }

    #[allow(dead_code)]
    pub fn scratch(&self) -> &Path {
        self.dir.path()
    }

    /// Bundles currently unpacked by this beacon.
    #[allow(dead_code)]
    pub fn unpacked_bundles(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.dir.path().join("runtime").join("bundles")) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Wait for a beacon that was told to stop. The scratch directory is
    /// handed back so its contents can still be inspected.
    #[allow(dead_code)]
    pub async fn join(self) -> (cohort::Result<()>, TempDir) {
        let result = tokio::time::timeout(Duration::from_secs(5), self.server.wait())
            .await
            .expect("beacon did not stop");
        (result, self.dir)
    }

    #[allow(dead_code)]
    pub async fn stop(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server.wait()).await;
    }
}

/// Path of the sample greeter built alongside the tests.
#[allow(dead_code)]
pub fn greeter() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cohort-greeter"))
}

/// Write an executable shell script into `dir`.
#[allow(dead_code)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A small launcher script that runs the greeter, so bundles stay tiny.
/// `linger_ms` is passed through as the greeter's third argument.
#[allow(dead_code)]
pub fn greeter_script(dir: &Path, linger_ms: Option<u64>) -> PathBuf {
    let linger = linger_ms.map(|ms| format!(" {}", ms)).unwrap_or_default();
    script(
        dir,
        "greet.sh",
        &format!("exec {} \"$1\" \"$2\"{}", greeter().display(), linger),
    )
}

/// Like [`greeter_script`], but every rank first records its pid as
/// `<pid_dir>/<rank>.pid`.
#[allow(dead_code)]
pub fn recording_greeter_script(dir: &Path, pid_dir: &Path, linger_ms: u64) -> PathBuf {
    script(
        dir,
        "greet-recording.sh",
        &format!(
            "echo $$ > {}/$2.pid\nexec {} \"$1\" \"$2\" {}",
            pid_dir.display(),
            greeter().display(),
            linger_ms
        ),
    )
}

/// Pid recorded by `rank`, if it got that far.
#[allow(dead_code)]
pub fn recorded_pid(pid_dir: &Path, rank: usize) -> Option<u32> {
    std::fs::read_to_string(pid_dir.join(format!("{}.pid", rank)))
        .ok()
        .and_then(|pid| pid.trim().parse().ok())
}

/// Whether a process with this pid still exists.
#[allow(dead_code)]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {} 2>/dev/null", pid))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Everything a submitter saw for one job.
#[derive(Debug)]
pub struct JobReport {
    pub admission: Admission,
    pub events: Vec<MonitorEvent>,
    pub outcome: Option<JobOutcome>,
}

impl JobReport {
    #[allow(dead_code)]
    pub fn stdout(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Stdout { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect();
        lines.sort();
        lines
    }

    #[allow(dead_code)]
    pub fn exits(&self) -> Vec<(usize, Option<i32>)> {
        let mut exits: Vec<(usize, Option<i32>)> = self
            .events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Exit { rank, code } => Some((*rank, *code)),
                _ => None,
            })
            .collect();
        exits.sort();
        exits
    }
}

/// Submit `job` through `socket` and follow it to the end.
#[allow(dead_code)]
pub async fn run_job(socket: &Path, job: JobDescriptor, timeout: Duration) -> JobReport {
    let size = job.size();
    let mut submitter = Submitter::connect(socket).await.unwrap();
    let admission = submitter.run(job).await.unwrap();
    if admission == Admission::Busy {
        return JobReport {
            admission,
            events: Vec::new(),
            outcome: None,
        };
    }

    let mut events = Vec::new();
    let outcome = tokio::time::timeout(
        timeout,
        submitter.watch(size, CancellationToken::new(), |event| {
            events.push(event.clone())
        }),
    )
    .await
    .expect("job did not finish in time")
    .unwrap();

    JobReport {
        admission,
        events,
        outcome: Some(outcome),
    }
}

/// Poll `condition` until it holds or `timeout_duration` passes.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "Condition not met within timeout: {}", message);
}
