use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::config::ConnectionSpec;
use crate::error::{Error, Step};
use crate::output::humanize_duration;
use crate::process::{self, Outcome};
use crate::remote::{ExecutionResult, Remote};
use crate::shell;

// ssh exits with this when it could not connect or authenticate, otherwise
// with the remote command's own status.
const SSH_ERROR_EXIT: i32 = 255;

const SERVER_ALIVE_INTERVAL_SECS: u32 = 15;
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

//
// Public API
// Start with: SSH::new
//

// Remote over the OpenSSH client and rsync. Never prompts: batch mode, one
// identity, host key must be known (or accept-new if asked for).
pub struct SSH {
    host: String,
    destination: String,
    // everything between `ssh` and the destination
    options: Vec<String>,
    ssh_program: String,
    rsync_program: String,
}

impl SSH {
    // OpenSSH version, e.g. "OpenSSH_9.6p1, OpenSSL 3.0.13 30 Jan 2024"
    pub fn version() -> Option<String> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-V");
        match process::run(&mut cmd, Duration::from_secs(5)) {
            // ssh -V writes to stderr
            Ok(Outcome::Exited(r)) if r.success() => Some(r.stderr.trim().to_string()),
            _ => None,
        }
    }

    // key: file for `-i`, see key::materialize
    pub fn new(conn: &ConnectionSpec, key: &Path) -> SSH {
        let mut options = vec![
            "-i".to_string(),
            key.display().to_string(),
            "-p".to_string(),
            conn.port.to_string(),
            "-T".to_string(),
        ];
        let mut opts = vec![
            "BatchMode=yes".to_string(),
            "IdentitiesOnly=yes".to_string(),
            format!("ConnectTimeout={}", conn.connect_timeout.as_secs().max(1)),
            format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
            format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
            // keeps "Permanently added ..." out of captured stderr
            "LogLevel=ERROR".to_string(),
        ];
        if conn.accept_new_host_keys {
            opts.push("StrictHostKeyChecking=accept-new".to_string());
        }
        for o in opts {
            options.push("-o".to_string());
            options.push(o);
        }

        SSH {
            host: conn.host.clone(),
            destination: conn.destination(),
            options,
            ssh_program: "ssh".to_string(),
            rsync_program: "rsync".to_string(),
        }
    }

    fn ssh_command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(&self.options).arg(&self.destination).arg(remote_cmd);
        cmd
    }

    // What rsync runs as its transport, a single shell-quoted string
    fn rsync_shell(&self) -> String {
        let mut parts = vec![self.ssh_program.clone()];
        parts.extend(self.options.iter().cloned());
        shell::join_args(&parts)
    }

    fn rsync_args(&self, src: &Path, dst: &str, excludes: &[String]) -> Vec<String> {
        let src = src.display().to_string();
        let dst = dst.trim_end_matches('/');
        let mut args = vec![
            "--archive".to_string(),
            "--compress".to_string(),
            "--delete".to_string(),
            "--protect-args".to_string(),
        ];
        for pattern in excludes {
            args.push(format!("--exclude={pattern}"));
        }
        // rsync only creates the last path component itself
        args.push(format!(
            "--rsync-path=mkdir -p {} && rsync",
            shell::quote_remote_path(dst)
        ));
        args.push("-e".to_string());
        args.push(self.rsync_shell());
        // trailing slash: copy the contents, not the directory itself
        args.push(format!("{}/", src.trim_end_matches('/')));
        // relative remote paths are resolved against the home directory
        let dst = dst.strip_prefix("~/").unwrap_or(dst);
        args.push(format!("{}:{}/", self.destination, dst));
        args
    }

    fn connection_error(
        &self,
        step: Step,
        reason: impl Into<String>,
        output: Option<ExecutionResult>,
    ) -> Error {
        Error::Connection {
            host: self.host.clone(),
            step,
            reason: reason.into(),
            output,
        }
    }
}

impl Remote for SSH {
    fn run_remote_cmd(
        &self,
        step: Step,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, Error> {
        debug!("ssh {} ({step}): {cmd}", self.destination);
        let mut ssh = self.ssh_command(cmd);
        match process::run(&mut ssh, timeout) {
            Err(err) => Err(self.connection_error(
                step,
                format!("could not start {}: {err}", self.ssh_program),
                None,
            )),
            Ok(Outcome::TimedOut(r)) => {
                let reason = format!("timed out after {}", humanize_duration(timeout));
                Err(self.connection_error(step, reason, Some(r)))
            }
            Ok(Outcome::Exited(r)) if r.exit_code == SSH_ERROR_EXIT => {
                let reason = last_line(&r.stderr)
                    .unwrap_or("ssh exited with 255")
                    .to_string();
                Err(self.connection_error(step, reason, Some(r)))
            }
            Ok(Outcome::Exited(r)) => Ok(r),
        }
    }

    fn mirror(
        &self,
        src: &Path,
        dst: &str,
        excludes: &[String],
        timeout: Duration,
    ) -> Result<(), Error> {
        let args = self.rsync_args(src, dst, excludes);
        debug!("rsync {}", shell::join_args(&args));
        let mut rsync = Command::new(&self.rsync_program);
        rsync.args(&args);
        match process::run(&mut rsync, timeout) {
            Err(err) => Err(Error::Transfer {
                code: None,
                stderr: format!("could not start {}: {err}", self.rsync_program),
            }),
            Ok(Outcome::TimedOut(r)) => Err(Error::Transfer {
                code: None,
                stderr: format!(
                    "timed out after {}\n{}",
                    humanize_duration(timeout),
                    r.stderr
                ),
            }),
            Ok(Outcome::Exited(r)) if r.success() => {
                debug!("rsync finished in {}", humanize_duration(r.elapsed));
                Ok(())
            }
            Ok(Outcome::Exited(r)) => Err(Error::Transfer {
                code: Some(r.exit_code),
                stderr: r.stderr,
            }),
        }
    }
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

// Dry run: report what would happen, touch nothing.
// The probe gets empty output, which reads as "marker absent", so the whole
// sequence is shown.
pub struct MockSSH {
    destination: String,
}

impl MockSSH {
    pub fn new(conn: &ConnectionSpec) -> MockSSH {
        MockSSH {
            destination: conn.destination(),
        }
    }
}

impl Remote for MockSSH {
    fn run_remote_cmd(
        &self,
        step: Step,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<ExecutionResult, Error> {
        println!("would run {step} on {}: {cmd}", self.destination);
        Ok(ExecutionResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
        })
    }

    fn mirror(
        &self,
        src: &Path,
        dst: &str,
        excludes: &[String],
        _timeout: Duration,
    ) -> Result<(), Error> {
        println!(
            "would mirror {} -> {}:{dst} (excluding {})",
            src.display(),
            self.destination,
            excludes.join(", ")
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeySource;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn conn(port: u16, accept_new: bool) -> ConnectionSpec {
        ConnectionSpec {
            host: "gitlab.internal".to_string(),
            user: "ci".to_string(),
            key: KeySource::Path(PathBuf::from("/keys/id")),
            port,
            connect_timeout: Duration::from_secs(10),
            accept_new_host_keys: accept_new,
        }
    }

    #[test]
    fn test_ssh_options() {
        let ssh = SSH::new(&conn(2222, false), Path::new("/keys/id"));
        assert_eq!(&ssh.options[..4], &["-i", "/keys/id", "-p", "2222"]);
        assert!(ssh.options.contains(&"BatchMode=yes".to_string()));
        assert!(ssh.options.contains(&"ConnectTimeout=10".to_string()));
        assert!(!ssh
            .options
            .iter()
            .any(|o| o.starts_with("StrictHostKeyChecking")));

        let ssh = SSH::new(&conn(22, true), Path::new("/keys/id"));
        assert!(ssh
            .options
            .contains(&"StrictHostKeyChecking=accept-new".to_string()));
    }

    #[test]
    fn test_ssh_command_line() {
        let ssh = SSH::new(&conn(22, false), Path::new("/keys/id"));
        let cmd = ssh.ssh_command("echo hi");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "ssh");
        assert_eq!(args[args.len() - 2], "ci@gitlab.internal");
        assert_eq!(args[args.len() - 1], "echo hi");
    }

    #[test]
    fn test_rsync_args() {
        let ssh = SSH::new(&conn(2222, false), Path::new("/keys/my id"));
        let args = ssh.rsync_args(
            Path::new("/builds/backup-scripts/"),
            "/opt/backups/",
            &[".git".to_string(), "*.pyc".to_string()],
        );
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--exclude=.git".to_string()));
        assert!(args.contains(&"--exclude=*.pyc".to_string()));
        assert!(args.contains(&"--rsync-path=mkdir -p '/opt/backups' && rsync".to_string()));

        let e = args.iter().position(|a| a == "-e").unwrap();
        assert!(args[e + 1].starts_with("ssh -i '/keys/my id' -p 2222 -T"));

        assert_eq!(args[args.len() - 2], "/builds/backup-scripts/");
        assert_eq!(args[args.len() - 1], "ci@gitlab.internal:/opt/backups/");

        let args = ssh.rsync_args(Path::new("bundle"), "~/backups", &[]);
        assert!(args.contains(&"--rsync-path=mkdir -p \"$HOME\"/'backups' && rsync".to_string()));
        assert_eq!(args[args.len() - 2], "bundle/");
        assert_eq!(args[args.len() - 1], "ci@gitlab.internal:backups/");
    }

    #[test]
    fn test_last_line() {
        assert_eq!(
            last_line("Warning: x\nssh: connect to host h port 22: Connection refused\n\n"),
            Some("ssh: connect to host h port 22: Connection refused")
        );
        assert_eq!(last_line(" \n"), None);
    }

    #[test]
    fn test_mock_reports_success() {
        let mock = MockSSH::new(&conn(22, false));
        let r = mock
            .run_remote_cmd(Step::Probe, "true", Duration::from_secs(1))
            .unwrap();
        assert!(r.success());
        assert!(r.stdout.is_empty());
        assert!(mock
            .mirror(Path::new("."), "/opt/backups", &[], Duration::from_secs(1))
            .is_ok());
    }

    // An executable shell script standing in for ssh or rsync
    fn stub(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn stubbed(ssh_body: &str, rsync_body: &str) -> (TempDir, SSH) {
        let dir = tempfile::tempdir().unwrap();
        let mut ssh = SSH::new(&conn(22, false), Path::new("/keys/id"));
        ssh.ssh_program = stub(&dir, "ssh", ssh_body);
        ssh.rsync_program = stub(&dir, "rsync", rsync_body);
        (dir, ssh)
    }

    #[test]
    fn test_ssh_255_is_connection_error() {
        let (_dir, ssh) = stubbed(
            "echo 'ssh: connect to host gitlab.internal port 22: Connection refused' >&2; exit 255",
            "exit 0",
        );
        match ssh.run_remote_cmd(Step::Probe, "true", Duration::from_secs(10)) {
            Err(Error::Connection {
                host,
                step,
                reason,
                output,
            }) => {
                assert_eq!(host, "gitlab.internal");
                assert_eq!(step, Step::Probe);
                assert_eq!(
                    reason,
                    "ssh: connect to host gitlab.internal port 22: Connection refused"
                );
                assert_eq!(output.map(|r| r.exit_code), Some(255));
            }
            other => panic!("expected a connection error, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_exit_status_passes_through() {
        let (_dir, ssh) = stubbed("echo \"$@\"; echo oops >&2; exit 3", "exit 0");
        let r = ssh
            .run_remote_cmd(Step::Invoke, "python3 main.py", Duration::from_secs(10))
            .unwrap();
        assert_eq!(r.exit_code, 3);
        assert!(r.stdout.trim_end().ends_with("ci@gitlab.internal python3 main.py"));
        assert_eq!(r.stderr, "oops\n");
    }

    #[test]
    fn test_ssh_timeout_keeps_output() {
        let (_dir, ssh) = stubbed(
            "echo 'gitlab-backup: dumping database'; echo 'progress 40%' >&2; exec sleep 30",
            "exit 0",
        );
        match ssh.run_remote_cmd(Step::Invoke, "python3 main.py", Duration::from_millis(500)) {
            Err(Error::Connection {
                step,
                reason,
                output: Some(r),
                ..
            }) => {
                assert_eq!(step, Step::Invoke);
                assert_eq!(reason, "timed out after 500ms");
                assert_eq!(r.stdout, "gitlab-backup: dumping database\n");
                assert_eq!(r.stderr, "progress 40%\n");
            }
            other => panic!("expected a connection error with output, got {other:?}"),
        }
    }

    #[test]
    fn test_ssh_missing_program() {
        let mut ssh = SSH::new(&conn(22, false), Path::new("/keys/id"));
        ssh.ssh_program = "/nonexistent/kickstart-ssh".to_string();
        assert!(matches!(
            ssh.run_remote_cmd(Step::Probe, "true", Duration::from_secs(1)),
            Err(Error::Connection {
                step: Step::Probe,
                output: None,
                ..
            })
        ));
    }

    #[test]
    fn test_rsync_failure_is_transfer_error() {
        let (_dir, ssh) = stubbed(
            "exit 0",
            "echo 'rsync: mkdir \"/opt/backups\" failed: Permission denied (13)' >&2; exit 23",
        );
        let bundle = tempfile::tempdir().unwrap();
        match ssh.mirror(bundle.path(), "/opt/backups", &[], Duration::from_secs(10)) {
            Err(Error::Transfer { code, stderr }) => {
                assert_eq!(code, Some(23));
                assert!(stderr.contains("Permission denied (13)"));
            }
            other => panic!("expected a transfer error, got {other:?}"),
        }
    }

    #[test]
    fn test_rsync_timeout_is_transfer_error() {
        let (_dir, ssh) = stubbed("exit 0", "echo 'sending incremental file list' >&2; exec sleep 30");
        let bundle = tempfile::tempdir().unwrap();
        match ssh.mirror(bundle.path(), "/opt/backups", &[], Duration::from_millis(300)) {
            Err(Error::Transfer { code, stderr }) => {
                assert_eq!(code, None);
                assert!(stderr.starts_with("timed out after 300ms\n"));
                assert!(stderr.contains("sending incremental file list"));
            }
            other => panic!("expected a transfer error, got {other:?}"),
        }
    }

    #[test]
    fn test_rsync_success() {
        let (_dir, ssh) = stubbed("exit 0", "exit 0");
        let bundle = tempfile::tempdir().unwrap();
        assert!(ssh
            .mirror(bundle.path(), "/opt/backups", &[], Duration::from_secs(10))
            .is_ok());
    }
}
