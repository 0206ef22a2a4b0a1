use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::clienv::Layout;
use crate::error::{PanelError, Result};
use crate::module::{compare_versions, ModuleKind};

static EMBEDDED: OnceLock<Catalog> = OnceLock::new();

const CATALOG_TOML: &str = include_str!("../catalog.toml");

/// One downloadable distribution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub url: String,
    /// Archive size in bytes, 0 when unknown.
    #[serde(default)]
    pub size: u64,
}

/// Available versions per module, `[<module>."<version>"]` in TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    modules: BTreeMap<ModuleKind, BTreeMap<String, CatalogEntry>>,
}

impl Catalog {
    pub fn parse(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| PanelError::Catalog(e.to_string()))
    }

    /// The catalog compiled into the binary.
    pub fn embedded() -> Result<&'static Catalog> {
        if let Some(catalog) = EMBEDDED.get() {
            return Ok(catalog);
        }
        let parsed = Self::parse(CATALOG_TOML)?;
        Ok(EMBEDDED.get_or_init(|| parsed))
    }

    /// `userdata/catalog.toml` when present, else the embedded catalog.
    pub fn load(layout: &Layout) -> Result<Self> {
        let path = layout.catalog_override_path();
        if path.is_file() {
            let source = std::fs::read_to_string(&path)?;
            tracing::debug!(path = %path.display(), "Using catalog override");
            return toml::from_str(&source)
                .map_err(|e| PanelError::Catalog(format!("{}: {}", path.display(), e)));
        }
        Self::embedded().cloned()
    }

    pub fn entry(&self, kind: ModuleKind, version: &str) -> Option<&CatalogEntry> {
        self.modules.get(&kind)?.get(version)
    }

    /// Like [`Catalog::entry`], but a miss is an error naming the known versions.
    pub fn require(&self, kind: ModuleKind, version: &str) -> Result<&CatalogEntry> {
        self.entry(kind, version).ok_or_else(|| {
            let known = self.versions(kind);
            PanelError::Catalog(if known.is_empty() {
                format!("no downloads listed for {}", kind)
            } else {
                format!(
                    "{} {} is not listed (available: {})",
                    kind,
                    version,
                    known.join(", ")
                )
            })
        })
    }

    /// Newest first.
    pub fn versions(&self, kind: ModuleKind) -> Vec<&str> {
        let mut versions: Vec<&str> = self
            .modules
            .get(&kind)
            .map(|entries| entries.keys().map(String::as_str).collect())
            .unwrap_or_default();
        versions.sort_by(|a, b| compare_versions(b, a));
        versions
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleKind> + '_ {
        self.modules.keys().copied()
    }

    /// Summed size of the given downloads; unknown entries count as zero.
    pub fn total_size<'a>(&self, selection: impl IntoIterator<Item = (ModuleKind, &'a str)>) -> u64 {
        selection
            .into_iter()
            .filter_map(|(kind, version)| self.entry(kind, version))
            .map(|entry| entry.size)
            .sum()
    }
}

/// `31457280` -> `30.00 MB`
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "unknown".to_string();
    }
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_catalog_parses() {
        let catalog = Catalog::embedded().unwrap();
        assert!(catalog.entry(ModuleKind::Php, "8.2.12").is_some());
        for kind in ModuleKind::ALL {
            assert!(!catalog.versions(kind).is_empty(), "{} has no entries", kind);
        }
    }

    #[test]
    fn versions_are_sorted_newest_first() {
        let catalog = Catalog::parse(
            r#"
            [php."7.4.33"]
            url = "https://example.test/php-7.4.33.zip"
            [php."8.10.0"]
            url = "https://example.test/php-8.10.0.zip"
            [php."8.2.12"]
            url = "https://example.test/php-8.2.12.zip"
            size = 1024
            "#,
        )
        .unwrap();

        assert_eq!(
            catalog.versions(ModuleKind::Php),
            vec!["8.10.0", "8.2.12", "7.4.33"]
        );
        assert_eq!(catalog.entry(ModuleKind::Php, "7.4.33").unwrap().size, 0);
        assert_eq!(
            catalog.total_size([(ModuleKind::Php, "8.2.12"), (ModuleKind::Php, "9.0.0")]),
            1024
        );
    }

    #[test]
    fn unknown_module_is_rejected() {
        let err = Catalog::parse("[tomcat.\"10\"]\nurl = \"x\"\n").unwrap_err();
        assert!(matches!(err, PanelError::Catalog(_)));
    }

    #[test]
    fn override_file_replaces_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        std::fs::create_dir_all(layout.userdata_dir()).unwrap();
        std::fs::write(
            layout.catalog_override_path(),
            "[redis.\"7.2.4\"]\nurl = \"https://mirror.test/redis.tar.gz\"\n",
        )
        .unwrap();

        let catalog = Catalog::load(&layout).unwrap();
        assert_eq!(catalog.modules().collect::<Vec<_>>(), vec![ModuleKind::Redis]);

        let err = catalog.require(ModuleKind::Redis, "6.0").unwrap_err();
        assert!(err.to_string().contains("available: 7.2.4"));
    }

    #[test]
    fn sizes_render_in_megabytes() {
        assert_eq!(format_size(31457280), "30.00 MB");
        assert_eq!(format_size(0), "unknown");
    }
}
