use std::fs;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedExit {
    /// Ran to completion; negative codes are signal deaths.
    Exited(i32),
    /// Killed once the wall-clock deadline passed.
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub time_limit: Duration,
    pub memory_limit_bytes: Option<u64>,
}

/// Run `command` with stdout/stderr streamed to files; a `None` stderr
/// path merges both streams into the stdout file.
pub fn run_bounded(
    command: &[String],
    limits: RunLimits,
    stdout_path: &Path,
    stderr_path: Option<&Path>,
) -> Result<BoundedExit> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("process_command_empty"))?;

    let stdout = fs::File::create(stdout_path)?;
    let stderr = match stderr_path {
        Some(path) => fs::File::create(path)?,
        None => stdout.try_clone()?,
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    apply_memory_limit(&mut cmd, limits.memory_limit_bytes);

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("process_spawn_failed: {}: {}", program, e))?;

    let deadline = Instant::now() + limits.time_limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(BoundedExit::Exited(exit_code(status)));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(BoundedExit::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// The ceiling must be installed between fork and exec, inside the child
// itself; set from the parent afterward it cannot stop an allocation
// that already happened.
#[cfg(unix)]
fn apply_memory_limit(cmd: &mut Command, memory_limit_bytes: Option<u64>) {
    use nix::sys::resource::{setrlimit, Resource};
    use std::os::unix::process::CommandExt;

    let Some(bytes) = memory_limit_bytes else {
        return;
    };
    unsafe {
        cmd.pre_exec(move || {
            let limit = bytes as nix::libc::rlim_t;
            setrlimit(Resource::RLIMIT_AS, limit, limit)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
        });
    }
}

#[cfg(not(unix))]
fn apply_memory_limit(_cmd: &mut Command, memory_limit_bytes: Option<u64>) {
    if memory_limit_bytes.is_some() {
        tracing::warn!("address-space ceiling is unsupported on this platform; running unbounded");
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
