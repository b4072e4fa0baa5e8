use std::io::{self, Write};
use std::time::Duration;

use crate::error::Error;
use crate::remote::ExecutionResult;

// Remote program's stdout goes to our stdout untouched, so a CI log shows it
// as-is. Everything else is stderr.
pub fn report_success(result: &ExecutionResult, took: Duration) -> io::Result<()> {
    let mut out = io::stdout();
    out.write_all(result.stdout.as_bytes())?;
    out.flush()?;
    let mut err = io::stderr();
    err.write_all(result.stderr.as_bytes())?;
    writeln!(
        err,
        "Finished: remote command took {}, whole run {}.",
        humanize_duration(result.elapsed),
        humanize_duration(took)
    )?;
    err.flush()
}

// Captured output of the failed call, so the CI log is enough to diagnose it
pub fn report_failure(err: &Error) -> io::Result<()> {
    let mut out = io::stderr();
    write_failure(&mut out, err)?;
    out.flush()
}

fn write_failure(out: &mut impl Write, err: &Error) -> io::Result<()> {
    match err {
        Error::RemoteCommand { result, .. } => {
            write_captured(out, "stdout", &result.stdout)?;
            write_captured(out, "stderr", &result.stderr)?;
        }
        Error::Connection {
            output: Some(result),
            ..
        } => {
            write_captured(out, "stdout", &result.stdout)?;
            write_captured(out, "stderr", &result.stderr)?;
        }
        Error::Transfer { stderr, .. } => write_captured(out, "rsync stderr", stderr)?,
        Error::Validation(_) | Error::Connection { output: None, .. } => {}
    }
    Ok(())
}

fn write_captured(out: &mut impl Write, name: &str, text: &str) -> io::Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    writeln!(out, "--- {name} ---")?;
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    Ok(())
}

pub fn humanize_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else if secs >= 1 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}
