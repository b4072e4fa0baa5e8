use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Step};

// Outcome of one command, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    // -1 if the process was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// The two things we need from a remote host: run a shell command, and make a
// remote directory a copy of a local one.
//
// Implementations map failures to reach the host to Error::Connection, tagged
// with `step` (and Error::Transfer for mirror). A command that ran but exited
// non-zero is returned as Ok, the caller decides what that means.
pub trait Remote {
    fn run_remote_cmd(
        &self,
        step: Step,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, Error>;

    // src: local directory, its contents are copied (not the directory itself)
    // dst: remote directory. Remote files absent locally are deleted.
    fn mirror(
        &self,
        src: &Path,
        dst: &str,
        excludes: &[String],
        timeout: Duration,
    ) -> Result<(), Error>;
}
