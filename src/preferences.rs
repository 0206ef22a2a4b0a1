use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{PanelError, Result};
use crate::fsutil::{write_atomic, FileLock};
use crate::module::{ModuleKind, ModuleState};
use crate::registry::ModuleRegistry;

/// Older releases wrote `null` for unset flags; read those as the default.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub is_active: bool,

    /// Fields this release does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The persisted preference document (`userdata/config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default, deserialize_with = "null_as_default")]
    pub modules: BTreeMap<String, ModuleEntry>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub run_startup: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Preferences {
    fn default() -> Self {
        let modules = ModuleKind::ALL
            .into_iter()
            .map(|kind| (kind.as_str().to_string(), ModuleEntry::default()))
            .collect();
        Self {
            modules,
            run_startup: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl Preferences {
    pub fn module_state(&self, kind: ModuleKind) -> ModuleState {
        let entry = self.modules.get(kind.as_str());
        ModuleState {
            module: kind,
            selected_version: entry.and_then(|e| e.version.clone()),
            enabled: entry.map(|e| e.is_active).unwrap_or(false),
        }
    }

    pub fn module_mut(&mut self, kind: ModuleKind) -> &mut ModuleEntry {
        self.modules.entry(kind.as_str().to_string()).or_default()
    }

    pub fn set_module(&mut self, kind: ModuleKind, version: Option<&str>, enabled: bool) {
        let entry = self.module_mut(kind);
        entry.version = version.map(str::to_string);
        entry.is_active = enabled;
    }

    /// Background services flagged to start alongside the web stack.
    pub fn enabled_background(&self) -> Vec<ModuleKind> {
        ModuleKind::BACKGROUND
            .into_iter()
            .filter(|kind| self.module_state(*kind).enabled)
            .collect()
    }
}

/// Partial update of one module entry; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ModulePatch {
    pub version: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl ModulePatch {
    pub fn version(version: Option<String>) -> Self {
        Self {
            version: Some(version),
            ..Default::default()
        }
    }

    pub fn active(is_active: bool) -> Self {
        Self {
            is_active: Some(is_active),
            ..Default::default()
        }
    }
}

/// JSON-backed preference persistence. Every write re-reads the document,
/// applies the change and atomically replaces the file, holding a lock file
/// next to the document so concurrent invocations never lose an update.
pub struct PreferenceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Read the document, creating it with defaults when absent.
    pub fn load(&self) -> Result<Preferences> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file = FileLock::acquire(&self.lock_path())?;
        self.read_or_init()
    }

    /// Read-modify-write under the store lock.
    pub fn update<R>(&self, apply: impl FnOnce(&mut Preferences) -> Result<R>) -> Result<R> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _file = FileLock::acquire(&self.lock_path())?;
        let mut preferences = self.read_or_init()?;
        let result = apply(&mut preferences)?;
        self.write(&preferences)?;
        Ok(result)
    }

    pub fn update_module(&self, kind: ModuleKind, patch: ModulePatch) -> Result<()> {
        self.update(|prefs| {
            let entry = prefs.module_mut(kind);
            if let Some(version) = patch.version {
                entry.version = version;
            }
            if let Some(is_active) = patch.is_active {
                entry.is_active = is_active;
            }
            Ok(())
        })
    }

    pub fn select_version(
        &self,
        kind: ModuleKind,
        version: &str,
        registry: &ModuleRegistry,
    ) -> Result<()> {
        if !registry.is_installed(kind, version) {
            return Err(PanelError::VersionNotInstalled {
                module: kind,
                version: version.to_string(),
            });
        }
        tracing::info!(module = %kind, version, "Selecting version");
        self.update_module(kind, ModulePatch::version(Some(version.to_string())))
    }

    pub fn set_enabled(&self, kind: ModuleKind, enabled: bool) -> Result<()> {
        self.update(|prefs| {
            let entry = prefs.module_mut(kind);
            if enabled && kind.requires_runtime() && entry.version.is_none() {
                return Err(PanelError::MissingDependency {
                    module: kind,
                    detail: "select a version before enabling it".to_string(),
                });
            }
            entry.is_active = enabled;
            Ok(())
        })
    }

    pub fn set_run_startup(&self, run_startup: bool) -> Result<()> {
        self.update(|prefs| {
            prefs.run_startup = run_startup;
            Ok(())
        })
    }

    fn read_or_init(&self) -> Result<Preferences> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Creating default preferences");
            let preferences = Preferences::default();
            self.write(&preferences)?;
            return Ok(preferences);
        }

        tracing::trace!(path = %self.path.display(), "Loading preferences");
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, preferences: &Preferences) -> Result<()> {
        let mut content = serde_json::to_string_pretty(preferences)?;
        content.push('\n');
        write_atomic(&self.path, content.as_bytes())?;
        tracing::trace!(path = %self.path.display(), "Saved preferences");
        Ok(())
    }
}
