use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PanelError, Result};

/// Every component kind the panel knows how to install and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Apache,
    Nginx,
    Php,
    Mysql,
    Postgresql,
    Redis,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 6] = [
        ModuleKind::Apache,
        ModuleKind::Nginx,
        ModuleKind::Php,
        ModuleKind::Mysql,
        ModuleKind::Postgresql,
        ModuleKind::Redis,
    ];

    pub const BACKGROUND: [ModuleKind; 3] =
        [ModuleKind::Mysql, ModuleKind::Postgresql, ModuleKind::Redis];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Apache => "apache",
            ModuleKind::Nginx => "nginx",
            ModuleKind::Php => "php",
            ModuleKind::Mysql => "mysql",
            ModuleKind::Postgresql => "postgresql",
            ModuleKind::Redis => "redis",
        }
    }

    /// Web servers and PHP cannot be enabled without a selected version.
    pub fn requires_runtime(&self) -> bool {
        matches!(self, ModuleKind::Apache | ModuleKind::Nginx | ModuleKind::Php)
    }

    pub fn is_background(&self) -> bool {
        Self::BACKGROUND.contains(self)
    }

    /// Executable file name without platform suffix.
    pub fn executable_name(&self) -> &'static str {
        match self {
            ModuleKind::Apache => "httpd",
            ModuleKind::Nginx => "nginx",
            ModuleKind::Php => "php-cgi",
            ModuleKind::Mysql => "mysqld",
            ModuleKind::Postgresql => "postgres",
            ModuleKind::Redis => "redis-server",
        }
    }

    /// Sub-directories of an install root that may hold the executable, in lookup order.
    fn executable_dirs(&self) -> &'static [&'static str] {
        match self {
            ModuleKind::Apache => &["bin"],
            ModuleKind::Nginx => &["", "sbin"],
            ModuleKind::Php => &["", "bin"],
            ModuleKind::Mysql | ModuleKind::Postgresql => &["bin"],
            ModuleKind::Redis => &["", "bin"],
        }
    }

    /// Install root of one version directory, following each distribution's archive layout.
    pub fn install_root(&self, version_dir: &Path, version: &str) -> PathBuf {
        let nested = match self {
            ModuleKind::Apache => Some(version_dir.join("Apache24")),
            ModuleKind::Nginx => Some(version_dir.join(format!("nginx-{}", version))),
            _ => None,
        };
        match nested {
            Some(path) if path.is_dir() => path,
            _ => version_dir.to_path_buf(),
        }
    }

    /// Locate the main executable inside an install root.
    ///
    /// Falls back to the first candidate so a missing binary surfaces as a launch failure.
    pub fn locate_executable(&self, install_root: &Path) -> PathBuf {
        locate_tool(install_root, self.executable_dirs(), self.executable_name())
    }
}

/// Find `name` (plus the platform executable suffix) under one of `dirs`.
pub fn locate_tool(install_root: &Path, dirs: &[&str], name: &str) -> PathBuf {
    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
    let candidates: Vec<PathBuf> = dirs
        .iter()
        .map(|dir| {
            if dir.is_empty() {
                install_root.join(&file_name)
            } else {
                install_root.join(dir).join(&file_name)
            }
        })
        .collect();

    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self> {
        ModuleKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PanelError::UnknownModule(s.to_string()))
    }
}

/// One installed version of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRef {
    pub version: String,
    pub root: PathBuf,
}

impl InstallRef {
    pub fn new(version: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            root: root.into(),
        }
    }
}

/// All installed versions of one module kind, as enumerated from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub kind: ModuleKind,
    installed: Vec<InstallRef>,
}

impl ModuleDescriptor {
    pub fn new(kind: ModuleKind, mut installed: Vec<InstallRef>) -> Self {
        installed.sort_by(|a, b| compare_versions(&a.version, &b.version));
        installed.dedup_by(|a, b| a.version == b.version);
        Self { kind, installed }
    }

    pub fn installed(&self) -> &[InstallRef] {
        &self.installed
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.installed.iter().map(|i| i.version.as_str())
    }

    pub fn find(&self, version: &str) -> Option<&InstallRef> {
        self.installed.iter().find(|i| i.version == version)
    }

    pub fn latest(&self) -> Option<&InstallRef> {
        self.installed.last()
    }
}

/// Desired state of one module as stored in preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleState {
    pub module: ModuleKind,
    pub selected_version: Option<String>,
    pub enabled: bool,
}

/// The PHP runtime capability shared with the web servers that front it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhpBinding {
    pub install: InstallRef,
    pub major: u32,
}

impl PhpBinding {
    pub fn new(install: InstallRef) -> Result<Self> {
        let major = parse_major_version(&install.root)?;
        Ok(Self { install, major })
    }
}

/// Extract the major version from the first `N.N.N` token in the last path component.
pub fn parse_major_version(install_root: &Path) -> Result<u32> {
    let parse_failure = || PanelError::VersionParseFailure {
        path: install_root.to_path_buf(),
    };

    let name = install_root
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(parse_failure)?;

    name.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter_map(|token| {
            let parts: Vec<&str> = token.split('.').collect();
            if parts.len() >= 3 && parts[..3].iter().all(|p| !p.is_empty()) {
                parts[0].parse::<u32>().ok()
            } else {
                None
            }
        })
        .next()
        .ok_or_else(parse_failure)
}

/// Numeric-aware version ordering: "8.10.0" sorts after "8.9.1".
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split(|c: char| c == '.' || c == '-')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };

    parse(a).cmp(&parse(b)).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_round_trip() {
        for kind in ModuleKind::ALL {
            assert_eq!(kind.as_str().parse::<ModuleKind>().unwrap(), kind);
        }
        assert!("tomcat".parse::<ModuleKind>().is_err());
        assert_eq!("PHP".parse::<ModuleKind>().unwrap(), ModuleKind::Php);
    }

    #[test]
    fn major_version_from_install_path() {
        assert_eq!(parse_major_version(Path::new("/opt/bin/php/8.2.12")).unwrap(), 8);
        assert_eq!(
            parse_major_version(Path::new("/opt/bin/php/php-7.4.33-nts")).unwrap(),
            7
        );
        assert!(matches!(
            parse_major_version(Path::new("/opt/bin/php/latest")),
            Err(PanelError::VersionParseFailure { .. })
        ));
        assert!(parse_major_version(Path::new("/opt/bin/php/8.2")).is_err());
    }

    #[test]
    fn php_binding_reads_major_from_install_dir() {
        let php8 = PhpBinding::new(InstallRef::new("8.2.12", "/x/php/8.2.12")).unwrap();
        let php7 = PhpBinding::new(InstallRef::new("7.4.33", "/x/php/7.4.33")).unwrap();
        assert_eq!(php8.major, 8);
        assert_eq!(php7.major, 7);
    }

    #[test]
    fn versions_sort_numerically() {
        let descriptor = ModuleDescriptor::new(
            ModuleKind::Php,
            vec![
                InstallRef::new("8.10.0", "/a"),
                InstallRef::new("8.2.12", "/b"),
                InstallRef::new("7.4.33", "/c"),
            ],
        );
        let versions: Vec<&str> = descriptor.versions().collect();
        assert_eq!(versions, vec!["7.4.33", "8.2.12", "8.10.0"]);
        assert_eq!(descriptor.latest().unwrap().version, "8.10.0");
    }

    #[test]
    fn install_root_uses_nested_distribution_dir() {
        let dir = tempfile::tempdir().unwrap();
        let version_dir = dir.path().join("2.4.58");
        std::fs::create_dir_all(version_dir.join("Apache24")).unwrap();

        assert_eq!(
            ModuleKind::Apache.install_root(&version_dir, "2.4.58"),
            version_dir.join("Apache24")
        );
        assert_eq!(
            ModuleKind::Nginx.install_root(&version_dir, "2.4.58"),
            version_dir
        );
    }
}
