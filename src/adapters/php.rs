use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::{AdapterContext, ServiceAdapter, StartStatus, StopStatus, TrackedProcess};
use crate::configurator::php_fastcgi_address;
use crate::error::{PanelError, Result};
use crate::module::{ModuleKind, PhpBinding};
use crate::runner::{LaunchSpec, ProcessHandle};

const INI_TEMPLATES: [&str; 2] = ["php.ini-development", "php.ini-production"];

/// `php-cgi` bound to the shared FastCGI loopback address.
pub struct PhpRuntime {
    binding: PhpBinding,
    ini_path: PathBuf,
    process: TrackedProcess,
}

impl PhpRuntime {
    /// Provisions `php.ini` from the bundled templates when the install has none.
    pub fn new(ctx: AdapterContext, binding: PhpBinding) -> Result<Self> {
        let ini_path = provision_ini(&binding.install.root)?;
        Ok(Self {
            binding,
            ini_path,
            process: TrackedProcess::new(ModuleKind::Php, ctx),
        })
    }

    pub fn ini_path(&self) -> &Path {
        &self.ini_path
    }

    fn launch_spec(&self) -> LaunchSpec {
        let root = &self.binding.install.root;
        LaunchSpec::new(
            ModuleKind::Php,
            ModuleKind::Php.locate_executable(root),
            self.process.log_sink(),
        )
        .args(["-b".to_string(), php_fastcgi_address()])
        .arg("-c")
        .arg(self.ini_path.display().to_string())
        .env("PHP_FCGI_MAX_REQUESTS", "0")
        .working_dir(root)
    }
}

fn provision_ini(root: &Path) -> Result<PathBuf> {
    let ini_path = root.join("php.ini");
    if ini_path.is_file() {
        return Ok(ini_path);
    }

    let template = INI_TEMPLATES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| PanelError::MissingDependency {
            module: ModuleKind::Php,
            detail: format!(
                "no php.ini, {} or {} in {}",
                INI_TEMPLATES[0],
                INI_TEMPLATES[1],
                root.display()
            ),
        })?;

    std::fs::copy(&template, &ini_path)?;
    tracing::info!(from = %template.display(), to = %ini_path.display(), "Provisioned php.ini");
    Ok(ini_path)
}

#[async_trait]
impl ServiceAdapter for PhpRuntime {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Php
    }

    fn version(&self) -> &str {
        &self.binding.install.version
    }

    async fn start(&self) -> Result<StartStatus> {
        self.process.launch(self.launch_spec()).await
    }

    async fn stop(&self) -> Result<StopStatus> {
        self.process.stop().await
    }

    async fn reap_orphans(&self) -> Result<usize> {
        self.process
            .reap(&[ModuleKind::Php.executable_name()])
            .await
    }

    fn is_running(&self) -> bool {
        self.process.is_running()
    }

    fn handle(&self) -> Option<ProcessHandle> {
        self.process.handle()
    }
}
