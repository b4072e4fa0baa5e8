// Probe for the marker, mirror the bundle if it is missing, run the entry
// command. At most three remote calls, in that order, no retries: the first
// error ends the run.

use tracing::info;

use crate::config::{BootstrapPlan, ConnectionSpec};
use crate::error::{Error, Step};
use crate::output::humanize_duration;
use crate::remote::{ExecutionResult, Remote};
use crate::shell::{quote, quote_remote_path};

// Printed by the probe command only when the marker is in place
pub const PROBE_PRESENT: &str = "kickstart:marker-present";

// Exits 0 whether or not the marker is there. A missing path is an answer,
// not a failure.
pub fn probe_command(plan: &BootstrapPlan) -> String {
    format!(
        "if [ -d {} ] && [ -f {} ]; then echo {PROBE_PRESENT}; fi",
        quote_remote_path(&plan.target_dir),
        quote_remote_path(&plan.marker_path()),
    )
}

pub fn invoke_command(plan: &BootstrapPlan) -> String {
    format!(
        "cd {} && sudo -n sh -c {}",
        quote_remote_path(&plan.target_dir),
        quote(&plan.entry_command()),
    )
}

// true if the target directory exists and holds the marker file
pub fn probe(remote: &dyn Remote, plan: &BootstrapPlan) -> Result<bool, Error> {
    let result =
        remote.run_remote_cmd(Step::Probe, &probe_command(plan), plan.call_timeout)?;
    if !result.success() {
        return Err(Error::RemoteCommand {
            step: Step::Probe,
            result,
        });
    }
    // login scripts may print their own lines around ours
    Ok(result.stdout.lines().any(|l| l.trim() == PROBE_PRESENT))
}

// Make the remote target directory a copy of the local bundle.
// On error the remote state is unknown, don't invoke anything after it.
pub fn mirror(remote: &dyn Remote, plan: &BootstrapPlan) -> Result<(), Error> {
    plan.check_bundle()?;
    remote.mirror(
        &plan.bundle_dir,
        &plan.target_dir,
        &plan.excludes,
        plan.call_timeout,
    )
}

pub fn invoke(remote: &dyn Remote, plan: &BootstrapPlan) -> Result<ExecutionResult, Error> {
    let result =
        remote.run_remote_cmd(Step::Invoke, &invoke_command(plan), plan.invoke_timeout)?;
    if result.success() {
        return Ok(result);
    }
    let step = if refused_by_sudo(&result.stderr) {
        Step::Escalate
    } else {
        Step::Invoke
    };
    Err(Error::RemoteCommand { step, result })
}

// `sudo -n` prints e.g. "sudo: a password is required" and never starts the
// entry command
fn refused_by_sudo(stderr: &str) -> bool {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map_or(false, |l| l.starts_with("sudo:"))
}

pub fn run(
    conn: &ConnectionSpec,
    plan: &BootstrapPlan,
    remote: &dyn Remote,
) -> Result<ExecutionResult, Error> {
    conn.validate()?;
    plan.validate()?;

    info!(
        "checking {}:{} for {}",
        conn.destination(),
        plan.target_dir,
        plan.marker
    );
    let exists = probe(remote, plan)?;

    if !exists || plan.always_mirror {
        if exists {
            info!("marker present, mirroring anyway");
        } else {
            info!("marker missing, mirroring {}", plan.bundle_dir.display());
        }
        mirror(remote, plan)?;
    } else {
        info!("marker present, skipping mirror");
    }

    info!("running `{}` in {}", plan.entry_command(), plan.target_dir);
    let result = invoke(remote, plan)?;
    info!(
        "entry command exited 0 after {}",
        humanize_duration(result.elapsed)
    );
    Ok(result)
}
