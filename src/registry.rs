use std::collections::HashMap;
use std::path::Path;

use crate::clienv::{normalize, Layout};
use crate::error::Result;
use crate::module::{InstallRef, ModuleDescriptor, ModuleKind};

/// Installed versions of every module, enumerated from `bin/<module>/<version>`.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleKind, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn scan(layout: &Layout) -> Result<Self> {
        let bin = layout.bin_dir();
        let mut modules = HashMap::new();

        for kind in ModuleKind::ALL {
            let descriptor = scan_module(&bin.join(kind.as_str()), kind)?;
            tracing::debug!(
                module = %kind,
                versions = descriptor.installed().len(),
                "Scanned installed versions"
            );
            modules.insert(kind, descriptor);
        }

        Ok(Self { modules })
    }

    pub fn from_descriptors(descriptors: Vec<ModuleDescriptor>) -> Self {
        let modules = descriptors.into_iter().map(|d| (d.kind, d)).collect();
        Self { modules }
    }

    pub fn descriptor(&self, kind: ModuleKind) -> Option<&ModuleDescriptor> {
        self.modules.get(&kind)
    }

    pub fn find(&self, kind: ModuleKind, version: &str) -> Option<&InstallRef> {
        self.descriptor(kind).and_then(|d| d.find(version))
    }

    pub fn is_installed(&self, kind: ModuleKind, version: &str) -> bool {
        self.find(kind, version).is_some()
    }

    pub fn versions(&self, kind: ModuleKind) -> Vec<String> {
        self.descriptor(kind)
            .map(|d| d.versions().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn scan_module(module_dir: &Path, kind: ModuleKind) -> Result<ModuleDescriptor> {
    if !module_dir.is_dir() {
        return Ok(ModuleDescriptor::new(kind, Vec::new()));
    }

    let mut installed = Vec::new();
    for entry in std::fs::read_dir(module_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(version) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        // leftovers of an interrupted download
        if version.starts_with('.') {
            continue;
        }
        let root = normalize(&kind.install_root(&entry.path(), &version));
        installed.push(InstallRef::new(version, root));
    }

    Ok(ModuleDescriptor::new(kind, installed))
}
