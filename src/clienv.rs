use std::path::{Component, Path, PathBuf};

use crate::module::ModuleKind;

const ENV_HOME: &str = "PERESVET_HOME";
const ENV_HTTP_PORT: &str = "PERESVET_HTTP_PORT";
const ENV_INTERNAL_PORT: &str = "PERESVET_INTERNAL_PORT";
const ENV_LOG: &str = "PERESVET_LOG";

const FALLBACK_DATA_DIR: &str = ".";
const PERESVET_SUBDIR: &str = "peresvet";

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_INTERNAL_PORT: u16 = 8080;

fn env_opt(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Log filter override ($PERESVET_LOG, falls back to $RUST_LOG in the subscriber)
pub fn log_filter() -> Option<String> {
    env_opt(ENV_LOG)
}

/// Installation root ($PERESVET_HOME or <data dir>/peresvet)
pub fn home_dir() -> PathBuf {
    let dir = env_opt(ENV_HOME).map(PathBuf::from).unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
            .join(PERESVET_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved home directory");
    dir
}

/// Listening ports of the web topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    /// Port the public-facing server binds.
    pub public: u16,
    /// Loopback port of the proxied origin in hybrid mode.
    pub internal: u16,
}

impl Ports {
    /// $PERESVET_HTTP_PORT / $PERESVET_INTERNAL_PORT or 80 / 8080
    pub fn from_env() -> Self {
        let parse = |key: &str, default: u16| {
            env_opt(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let ports = Self {
            public: parse(ENV_HTTP_PORT, DEFAULT_HTTP_PORT),
            internal: parse(ENV_INTERNAL_PORT, DEFAULT_INTERNAL_PORT),
        };
        tracing::trace!(public = ports.public, internal = ports.internal, "Resolved ports");
        ports
    }
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            public: DEFAULT_HTTP_PORT,
            internal: DEFAULT_INTERNAL_PORT,
        }
    }
}

/// Fixed on-disk layout under the installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub ports: Ports,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let absolute = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        Self {
            root: normalize(&absolute),
            ports: Ports::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(home_dir()).with_ports(Ports::from_env())
    }

    pub fn with_ports(mut self, ports: Ports) -> Self {
        self.ports = ports;
        self
    }

    /// Installed distributions: bin/<module>/<version>
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.root.join("sites")
    }

    pub fn userdata_dir(&self) -> PathBuf {
        self.root.join("userdata")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.userdata_dir().join("logs")
    }

    /// Access/error logs written by the servers themselves
    pub fn module_logs_dir(&self) -> PathBuf {
        self.userdata_dir().join("modules_logs")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.userdata_dir().join("pids")
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.userdata_dir().join("config.json")
    }

    pub fn session_path(&self) -> PathBuf {
        self.userdata_dir().join("session.json")
    }

    /// Held for the whole of a stack transition, across processes.
    pub fn stack_lock_path(&self) -> PathBuf {
        self.userdata_dir().join("stack.lock")
    }

    pub fn catalog_override_path(&self) -> PathBuf {
        self.userdata_dir().join("catalog.toml")
    }

    /// Aggregate start/stop/failure event log
    pub fn event_log_path(&self) -> PathBuf {
        self.logs_dir().join("server.log")
    }

    /// stdout/stderr sink of one component's process
    pub fn component_log_path(&self, kind: ModuleKind) -> PathBuf {
        self.logs_dir().join(format!("{}.log", kind.as_str()))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.bin_dir(),
            self.sites_dir().join("localhost"),
            self.logs_dir(),
            self.module_logs_dir(),
            self.pids_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Site directories under sites/, sorted by name. Names that cannot be
    /// written verbatim into a server block are skipped.
    pub fn site_names(&self) -> std::io::Result<Vec<String>> {
        let dir = self.sites_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                match entry.file_name().to_str() {
                    Some(name) if is_valid_site_name(name) => names.push(name.to_string()),
                    _ => tracing::warn!(
                        name = %entry.file_name().to_string_lossy(),
                        "Skipping site directory with an unusable name"
                    ),
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Site names become `ServerName` values and `server_name` tokens unquoted.
fn is_valid_site_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(
            normalize(Path::new("/opt/peresvet/./bin/../bin/php")),
            PathBuf::from("/opt/peresvet/bin/php")
        );
    }

    #[test]
    fn layout_paths_live_under_root() {
        let layout = Layout::new("/opt/peresvet");
        assert_eq!(layout.preferences_path(), PathBuf::from("/opt/peresvet/userdata/config.json"));
        assert_eq!(
            layout.component_log_path(ModuleKind::Php),
            PathBuf::from("/opt/peresvet/userdata/logs/php.log")
        );
        assert_eq!(layout.ports, Ports::default());
    }

    #[test]
    fn site_names_are_sorted_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.sites_dir().join("shop.test")).unwrap();
        std::fs::create_dir_all(layout.sites_dir().join("blog.test")).unwrap();
        std::fs::write(layout.sites_dir().join("notes.txt"), "x").unwrap();

        assert_eq!(layout.site_names().unwrap(), vec!["blog.test", "shop.test"]);
    }

    #[test]
    fn site_names_skip_directories_unsafe_for_server_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        for name in ["shop.test", "my site", "evil;listen 80", "a{b}", ".hidden", "api_v2-test"] {
            std::fs::create_dir_all(layout.sites_dir().join(name)).unwrap();
        }

        assert_eq!(layout.site_names().unwrap(), vec!["api_v2-test", "shop.test"]);
    }

    #[test]
    fn stack_lock_lives_in_userdata() {
        let layout = Layout::new("/opt/peresvet");
        assert_eq!(layout.stack_lock_path(), PathBuf::from("/opt/peresvet/userdata/stack.lock"));
    }
}
