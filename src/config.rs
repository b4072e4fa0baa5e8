use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use clap::ArgMatches;
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

pub const DEFAULT_PORT: &str = "22";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: &str = "10";
pub const DEFAULT_CALL_TIMEOUT_SECS: &str = "120";
pub const DEFAULT_INVOKE_TIMEOUT_SECS: &str = "1800";
pub const DEFAULT_EXCLUDES: &[&str] = &[".git", ".hg", ".svn"];

// Where the ssh private key comes from
#[derive(Debug)]
pub enum KeySource {
    // file on local disk
    Path(PathBuf),
    // key contents, usually a CI secret in an env var
    Material(SecretString),
}

impl KeySource {
    fn is_empty(&self) -> bool {
        match self {
            KeySource::Path(p) => p.as_os_str().is_empty(),
            KeySource::Material(m) => m.expose_secret().trim().is_empty(),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionSpec {
    pub host: String,
    pub user: String,
    pub key: KeySource,
    pub port: u16,
    pub connect_timeout: Duration,
    pub accept_new_host_keys: bool,
}

impl ConnectionSpec {
    pub fn validate(&self) -> Result<(), Error> {
        check_ssh_word("host", &self.host)?;
        check_ssh_word("user", &self.user)?;
        if self.key.is_empty() {
            return Err(Error::validation("private key is empty"));
        }
        if self.port == 0 {
            return Err(Error::validation("port must be a positive integer"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::validation("connect timeout must be positive"));
        }
        Ok(())
    }

    // user@host, as ssh and rsync want it
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

// Host and user end up as ssh arguments. Reject what ssh would read as an
// option or split into two words.
fn check_ssh_word(name: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::validation(format!("{name} is empty")));
    }
    if value.starts_with('-') {
        return Err(Error::validation(format!("{name} must not start with '-'")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!("{name} must not contain whitespace")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    // local directory mirrored to the remote
    pub bundle_dir: PathBuf,
    // remote directory, absolute or relative to the remote user's home
    pub target_dir: String,
    // relative to target_dir
    pub marker: String,
    // run in target_dir via `sudo -n sh -c`. `{target}` is replaced by target_dir.
    pub entry: String,
    pub excludes: Vec<String>,
    // probe and mirror
    pub call_timeout: Duration,
    pub invoke_timeout: Duration,
    // mirror even if the marker is already there
    pub always_mirror: bool,
}

impl BootstrapPlan {
    pub fn validate(&self) -> Result<(), Error> {
        if self.bundle_dir.as_os_str().is_empty() {
            return Err(Error::validation("bundle directory is empty"));
        }
        if self.target_dir.trim().is_empty() {
            return Err(Error::validation("target directory is empty"));
        }
        check_target(&self.target_dir)?;
        check_marker(&self.marker)?;
        if self.entry.trim().is_empty() {
            return Err(Error::validation("entry command is empty"));
        }
        if self.call_timeout.is_zero() || self.invoke_timeout.is_zero() {
            return Err(Error::validation("timeouts must be positive"));
        }
        Ok(())
    }

    // Only needed when we are about to mirror
    pub fn check_bundle(&self) -> Result<(), Error> {
        if !self.bundle_dir.is_dir() {
            return Err(Error::validation(format!(
                "bundle directory '{}' does not exist",
                self.bundle_dir.display()
            )));
        }
        Ok(())
    }

    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.target_dir.trim_end_matches('/'), self.marker)
    }

    pub fn entry_command(&self) -> String {
        self.entry.replace("{target}", &self.target_dir)
    }
}

// Mirroring deletes whatever the bundle lacks, so the target must name a
// directory below / or ~, spelled without `.` or `..`. This is a remote POSIX
// path, split on '/' rather than read as a local Path.
fn check_target(target: &str) -> Result<(), Error> {
    let refuse = || {
        Err(Error::validation(format!(
            "refusing to mirror into '{target}': name a directory below / or ~, without . or .."
        )))
    };
    let mut segments = target.split('/').filter(|s| !s.is_empty()).peekable();
    if target.starts_with('~') {
        segments.next_if_eq(&"~");
    }
    let mut has_name = false;
    for segment in segments {
        if segment == "." || segment == ".." {
            return refuse();
        }
        has_name = true;
    }
    if !has_name {
        return refuse();
    }
    Ok(())
}

// The marker must stay inside the target directory
fn check_marker(marker: &str) -> Result<(), Error> {
    let path = Path::new(marker);
    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::validation(format!(
                    "marker '{marker}' must be a relative path inside the target directory"
                )));
            }
        }
    }
    if !has_name {
        return Err(Error::validation("marker file path is empty"));
    }
    Ok(())
}

// Build both specs from the command line (flags, env vars, defaults).
// Missing values become empty fields, validate() reports them.
pub fn from_matches(args: &ArgMatches) -> Result<(ConnectionSpec, BootstrapPlan), Error> {
    let key = match (args.value_of("key-path"), args.value_of("key")) {
        (Some(_), Some(_)) => {
            return Err(Error::validation(
                "give either --key-path or --key, not both",
            ))
        }
        (Some(path), None) => KeySource::Path(expand(path)),
        (None, Some(material)) => KeySource::Material(SecretString::from(material.to_string())),
        (None, None) => {
            return Err(Error::validation("one of --key-path or --key is required"))
        }
    };

    let port = args.value_of("port").unwrap_or(DEFAULT_PORT);
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("port '{port}' is not a valid port number")))?;

    let conn = ConnectionSpec {
        host: value(args, "host"),
        user: value(args, "user"),
        key,
        port,
        connect_timeout: secs(args, "connect-timeout", DEFAULT_CONNECT_TIMEOUT_SECS)?,
        accept_new_host_keys: args.is_present("accept-new-host-keys"),
    };

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    if let Some(extra) = args.values_of("exclude") {
        excludes.extend(extra.map(String::from));
    }

    let plan = BootstrapPlan {
        bundle_dir: expand(&value(args, "bundle")),
        target_dir: value(args, "target"),
        marker: value(args, "marker"),
        entry: value(args, "entry"),
        excludes,
        call_timeout: secs(args, "timeout", DEFAULT_CALL_TIMEOUT_SECS)?,
        invoke_timeout: secs(args, "invoke-timeout", DEFAULT_INVOKE_TIMEOUT_SECS)?,
        always_mirror: args.is_present("always-mirror"),
    };
    Ok((conn, plan))
}

fn value(args: &ArgMatches, name: &str) -> String {
    args.value_of(name).unwrap_or_default().trim().to_string()
}

fn secs(args: &ArgMatches, name: &str, default: &str) -> Result<Duration, Error> {
    let raw = args.value_of(name).unwrap_or(default);
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| Error::validation(format!("--{name} '{raw}' is not a number of seconds")))
}

fn expand(path: &str) -> PathBuf {
    if path.is_empty() {
        return PathBuf::new();
    }
    PathBuf::from(shellexpand::tilde(path).into_owned())
}
