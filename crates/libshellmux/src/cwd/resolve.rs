use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Host facilities consulted while resolving directories.
pub trait HostEnv: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
    fn home_dir(&self) -> Option<PathBuf>;
    fn is_dir(&self, path: &Path) -> bool;
}

/// The real process environment and filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl HostEnv for SystemEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// Which shell conventions apply to `cd` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

static UNIX_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("UNIX_VAR is a compile-time constant")
});

static WINDOWS_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%([^%\s]+)%").expect("WINDOWS_VAR is a compile-time constant"));

/// Expand environment references. Unknown variables stay as written.
pub fn expand_env_vars(input: &str, platform: Platform, env: &dyn HostEnv) -> String {
    let pattern = match platform {
        Platform::Unix => &*UNIX_VAR,
        Platform::Windows => &*WINDOWS_VAR,
    };
    pattern
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            env.var(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Resolve a `cd` argument against `base`. Returns `None` unless the result
/// is an existing directory.
pub fn resolve_local_cwd(
    base: &Path,
    target: &str,
    platform: Platform,
    env: &dyn HostEnv,
) -> Option<PathBuf> {
    let target = target.trim();
    if target.is_empty() {
        return match platform {
            Platform::Unix => env.home_dir().filter(|home| env.is_dir(home)),
            Platform::Windows => Some(base.to_path_buf()),
        };
    }

    let expanded = expand_env_vars(target, platform, env);
    let candidate = if let Some(rest) = strip_tilde(&expanded, platform) {
        let home = env.home_dir()?;
        if rest.is_empty() { home } else { home.join(rest) }
    } else if let Some(root) = drive_root(&expanded, platform) {
        root
    } else {
        let path = PathBuf::from(&expanded);
        if is_rooted(&expanded, platform) {
            path
        } else {
            base.join(path)
        }
    };

    let candidate = normalize(&candidate);
    env.is_dir(&candidate).then_some(candidate)
}

fn strip_tilde(path: &str, platform: Platform) -> Option<&str> {
    if path == "~" {
        return Some("");
    }
    let rest = path
        .strip_prefix("~/")
        .or_else(|| match platform {
            Platform::Windows => path.strip_prefix("~\\"),
            Platform::Unix => None,
        })?;
    Some(rest)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// `D:` alone means the root of that drive.
fn drive_root(path: &str, platform: Platform) -> Option<PathBuf> {
    (platform == Platform::Windows && path.len() == 2 && has_drive_prefix(path))
        .then(|| PathBuf::from(format!("{}:\\", path[..1].to_ascii_uppercase())))
}

fn is_rooted(path: &str, platform: Platform) -> bool {
    match platform {
        Platform::Unix => path.starts_with('/'),
        Platform::Windows => {
            path.starts_with(['\\', '/']) || has_drive_prefix(path) || Path::new(path).is_absolute()
        }
    }
}

/// Lexically fold `.` and `..`. `..` at the root stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
