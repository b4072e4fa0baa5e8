// Run a local child process (ssh, rsync) with captured output and a deadline.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, select, tick, unbounded, Receiver, Sender};

use crate::remote::ExecutionResult;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

const READ_CHUNK: usize = 8 * 1024;

// Once the child has exited or been killed, how long we wait for its pipes to
// close. A grandchild that inherited them can keep them open forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Outcome {
    Exited(ExecutionResult),
    // Killed at the deadline. Holds whatever output arrived before that.
    TimedOut(ExecutionResult),
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

pub fn run(cmd: &mut Command, timeout: Duration) -> io::Result<Outcome> {
    let t_start = Instant::now();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // unbounded: readers must never stop emptying the pipes while we wait
    let (sender, receiver) = unbounded::<(Stream, Vec<u8>)>();
    let spawned = start_readers(&mut child, &sender);
    drop(sender);
    if let Err(err) = spawned {
        kill(&mut child);
        return Err(err);
    }

    let status = wait_until(&mut child, timeout)?;
    let (stdout, stderr) = drain(&receiver);
    let result = ExecutionResult {
        exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
        stdout,
        stderr,
        elapsed: t_start.elapsed(),
    };
    Ok(match status {
        Some(_) => Outcome::Exited(result),
        None => Outcome::TimedOut(result),
    })
}

fn start_readers(child: &mut Child, sender: &Sender<(Stream, Vec<u8>)>) -> io::Result<()> {
    if let Some(out) = child.stdout.take() {
        spawn_reader(out, Stream::Stdout, sender.clone())?;
    }
    if let Some(err) = child.stderr.take() {
        spawn_reader(err, Stream::Stderr, sender.clone())?;
    }
    Ok(())
}

fn spawn_reader<R>(mut src: R, stream: Stream, sender: Sender<(Stream, Vec<u8>)>) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    let name = match stream {
        Stream::Stdout => "stdout reader",
        Stream::Stderr => "stderr reader",
    };
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            // chunks, not read_to_end: output must reach us even if a
            // grandchild keeps the pipe open after the child is killed
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match src.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if sender.send((stream, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        })?;
    Ok(())
}

// None means the deadline passed and the child was killed
fn wait_until(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = after(timeout);
    let ticker = tick(POLL_INTERVAL);
    loop {
        let expired = select! {
            recv(ticker) -> _ => false,
            recv(deadline) -> _ => true,
        };
        let polled = child.try_wait();
        if let Some(done) = settle(child, polled, expired) {
            return done;
        }
    }
}

// None: keep waiting. A child we stop watching, for any reason, is killed
// and reaped first.
fn settle(
    child: &mut Child,
    polled: io::Result<Option<ExitStatus>>,
    expired: bool,
) -> Option<io::Result<Option<ExitStatus>>> {
    match polled {
        Ok(Some(status)) => Some(Ok(Some(status))),
        Ok(None) if expired => {
            kill(child);
            Some(Ok(None))
        }
        Ok(None) => None,
        Err(err) => {
            kill(child);
            Some(Err(err))
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain(receiver: &Receiver<(Stream, Vec<u8>)>) -> (String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Ok((stream, bytes)) = receiver.recv_deadline(deadline) {
        match stream {
            Stream::Stdout => stdout.extend_from_slice(&bytes),
            Stream::Stderr => stderr.extend_from_slice(&bytes),
        }
    }
    // decoded once at the end, a chunk can split a UTF-8 sequence
    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}
