//! Child worker process spawning.

use crate::WorkerSpec;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;
use workerfarm_core::{FarmError, Result};

/// A started child with its three pipes taken out
pub struct SpawnedChild {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn one worker process.
///
/// stdin/stdout carry the channel; stderr is piped so the farm can
/// forward stray output and panics to the log bus.
pub fn spawn_child(spec: &WorkerSpec) -> Result<SpawnedChild> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.arg("--module");
    cmd.arg(&spec.module);
    cmd.envs(&spec.env);

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        FarmError::SpawnFailure(format!("{}: {}", spec.program.display(), e))
    })?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| FarmError::SpawnFailure("child stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FarmError::SpawnFailure("child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FarmError::SpawnFailure("child stderr not captured".into()))?;

    debug!(pid, program = %spec.program.display(), module = %spec.module, "Spawned worker process");

    Ok(SpawnedChild {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let spec = WorkerSpec {
            program: PathBuf::from("/nonexistent/farm-worker"),
            ..WorkerSpec::default()
        };
        assert!(matches!(spawn_child(&spec), Err(FarmError::SpawnFailure(_))));
    }
}
