use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::{arg, ArgMatches};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

mod bootstrap;
mod config;
mod error;
mod key;
mod output;
mod process;
mod remote;
mod shell;
mod ssh;


use error::Error;
use ssh::{MockSSH, SSH};

const DESC: &str = r#"Example: kickstart --host gitlab.example.com --user ci --key-path ~/.ssh/id_ed25519 --bundle ./backup-scripts --target /opt/backup-scripts
If the marker file is missing from the target directory the bundle is mirrored there with rsync first.
The entry command then runs in the target directory under `sudo -n`.
Every option can also come from its KICKSTART_* environment variable."#;

fn cli() -> clap::Command<'static> {
    clap::Command::new("kickstart")
        .version(env!("CARGO_PKG_VERSION"))
        .about(DESC)
        .arg(
            arg!(--host <HOST> "Remote host to connect to")
                .required(false)
                .env("KICKSTART_HOST"),
        )
        .arg(
            arg!(--user <USER> "Remote user")
                .required(false)
                .env("KICKSTART_USER"),
        )
        .arg(
            arg!(--"key-path" <PATH> "Private key file")
                .required(false)
                .env("KICKSTART_KEY_PATH"),
        )
        .arg(
            arg!(--key <MATERIAL> "Private key contents, instead of --key-path")
                .required(false)
                .allow_hyphen_values(true)
                .hide_env_values(true)
                .env("KICKSTART_KEY"),
        )
        .arg(
            arg!(--port <PORT> "ssh port")
                .required(false)
                .env("KICKSTART_PORT")
                .default_value(config::DEFAULT_PORT),
        )
        .arg(
            arg!(--bundle <DIR> "Local directory to mirror to the remote")
                .required(false)
                .env("KICKSTART_BUNDLE")
                .default_value("."),
        )
        .arg(
            arg!(--target <DIR> "Remote directory to mirror into and run from")
                .required(false)
                .env("KICKSTART_TARGET"),
        )
        .arg(
            arg!(--marker <PATH> "File, relative to the target, whose presence means already provisioned")
                .required(false)
                .env("KICKSTART_MARKER")
                .default_value("main.py"),
        )
        .arg(
            arg!(--entry <CMD> "Command to run in the target directory. {target} is replaced.")
                .required(false)
                .env("KICKSTART_ENTRY")
                .default_value("python3 main.py"),
        )
        .arg(
            arg!(--exclude <PATTERN> "Extra rsync exclude pattern, can repeat")
                .required(false)
                .multiple_occurrences(true),
        )
        .arg(
            arg!(--"connect-timeout" <SECS> "Seconds to wait for the ssh connection")
                .required(false)
                .env("KICKSTART_CONNECT_TIMEOUT")
                .default_value(config::DEFAULT_CONNECT_TIMEOUT_SECS),
        )
        .arg(
            arg!(--timeout <SECS> "Seconds allowed for the probe and for the mirror")
                .required(false)
                .env("KICKSTART_TIMEOUT")
                .default_value(config::DEFAULT_CALL_TIMEOUT_SECS),
        )
        .arg(
            arg!(--"invoke-timeout" <SECS> "Seconds allowed for the entry command")
                .required(false)
                .env("KICKSTART_INVOKE_TIMEOUT")
                .default_value(config::DEFAULT_INVOKE_TIMEOUT_SECS),
        )
        .arg(arg!(--"always-mirror" "Mirror even if the marker is present").required(false))
        .arg(
            arg!(--"accept-new-host-keys" "Trust a host key we have never seen (never a changed one)")
                .required(false),
        )
        .arg(arg!(--"dry-run" "Show what we would do without doing it").required(false))
        .arg(arg!(-v --verbose "Debug level output").required(false))
}

fn main() -> ExitCode {
    let args = cli().get_matches();
    init_logging(args.is_present("verbose"));

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<Error>() {
            Some(e) => {
                error!("{} error: {e}", e.category());
                if let Err(write_err) = output::report_failure(e) {
                    debug!("could not write captured output: {write_err}");
                }
                ExitCode::from(e.exit_code())
            }
            None => {
                error!("{err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: &ArgMatches) -> anyhow::Result<()> {
    let t_start = Instant::now();
    let (conn, plan) = config::from_matches(args)?;
    // before any key material touches the disk
    conn.validate()?;
    plan.validate()?;

    let result = if args.is_present("dry-run") {
        bootstrap::run(&conn, &plan, &MockSSH::new(&conn))?
    } else {
        match SSH::version() {
            Some(v) => debug!("using {v}"),
            None => debug!("could not get ssh version"),
        }
        let key = key::materialize(&conn.key)?;
        let ssh = SSH::new(&conn, key.path());
        bootstrap::run(&conn, &plan, &ssh)?
    };

    output::report_success(&result, t_start.elapsed()).context("writing output")?;
    Ok(())
}
