use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use secrecy::ExposeSecret;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::KeySource;
use crate::error::Error;

// A private key file that ssh can read with `-i`.
// If we wrote it ourselves it is deleted on drop.
pub struct KeyFile {
    path: PathBuf,
    _temp: Option<NamedTempFile>,
}

impl KeyFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn materialize(source: &KeySource) -> anyhow::Result<KeyFile> {
    match source {
        KeySource::Path(path) => {
            let meta = fs::metadata(path).map_err(|err| {
                Error::validation(format!("key file '{}': {err}", path.display()))
            })?;
            if !meta.is_file() {
                return Err(
                    Error::validation(format!("key '{}' is not a file", path.display())).into(),
                );
            }
            if meta.permissions().mode() & 0o077 != 0 {
                warn!(
                    "key file {} is readable by others, ssh may refuse it",
                    path.display()
                );
            }
            Ok(KeyFile {
                path: path.clone(),
                _temp: None,
            })
        }
        KeySource::Material(material) => {
            let mut temp = tempfile::Builder::new()
                .prefix("kickstart-key-")
                .tempfile()
                .context("creating temporary key file")?;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))
                .context("restricting temporary key file permissions")?;
            temp.write_all(normalize(material.expose_secret()).as_bytes())
                .context("writing temporary key file")?;
            temp.flush().context("writing temporary key file")?;
            debug!("wrote key material to {}", temp.path().display());
            Ok(KeyFile {
                path: temp.path().to_path_buf(),
                _temp: Some(temp),
            })
        }
    }
}

// CI secret stores like to drop the final newline or add \r, OpenSSH rejects both
fn normalize(material: &str) -> String {
    let mut key = material.replace("\r\n", "\n").trim().to_string();
    key.push('\n');
    key
}
