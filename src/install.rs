use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{getegid, geteuid, Group, User};
use tracing::{debug, info};

use crate::error::HealthError;

const BINARY_MODE: u32 = 0o755;
const POLICY_MODE: u32 = 0o644;

pub fn is_privileged() -> bool {
    geteuid().is_root()
}

/// Account that owns files created by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub user: String,
    pub group: String,
}

impl Owner {
    pub fn current() -> Self {
        let uid = geteuid();
        let gid = getegid();
        let user = User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string());
        let group = Group::from_gid(gid)
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| gid.to_string());
        Self { user, group }
    }
}

/// Copy `source` to `target` with mode 0755 via a temp sibling and rename.
/// Returns `false` when `source` already is `target`.
pub fn install_binary(source: &Path, target: &Path) -> Result<bool, HealthError> {
    let same = match (fs::canonicalize(source), fs::canonicalize(target)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same {
        debug!(path = %target.display(), "Running from install path, nothing to copy");
        return Ok(false);
    }

    let install_err = |cause| HealthError::Install { path: target.to_path_buf(), cause };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(install_err)?;
    }
    let tmp = sibling(target, ".new");
    fs::copy(source, &tmp).map_err(install_err)?;
    fs::set_permissions(&tmp, Permissions::from_mode(BINARY_MODE)).map_err(install_err)?;
    fs::rename(&tmp, target).map_err(install_err)?;

    info!(from = %source.display(), to = %target.display(), "Installed binary");
    Ok(true)
}

/// Policy for the system log-rotation facility: weekly, four compressed
/// generations, recreated 0644 for `owner`.
pub fn render_logrotate(log_path: &Path, owner: &Owner) -> String {
    format!(
        "{} {{\n    weekly\n    rotate 4\n    compress\n    delaycompress\n    missingok\n    notifempty\n    create 644 {} {}\n}}\n",
        log_path.display(),
        owner.user,
        owner.group
    )
}

pub fn install_logrotate(policy_path: &Path, log_path: &Path, owner: &Owner) -> Result<(), HealthError> {
    let install_err = |cause| HealthError::Install { path: policy_path.to_path_buf(), cause };

    if let Some(parent) = policy_path.parent() {
        fs::create_dir_all(parent).map_err(install_err)?;
    }
    fs::write(policy_path, render_logrotate(log_path, owner)).map_err(install_err)?;
    fs::set_permissions(policy_path, Permissions::from_mode(POLICY_MODE)).map_err(install_err)?;

    info!(path = %policy_path.display(), "Installed log-rotation policy");
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
