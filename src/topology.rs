use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PanelError, Result};
use crate::module::{InstallRef, ModuleKind, PhpBinding};
use crate::preferences::Preferences;
use crate::registry::ModuleRegistry;

/// Arrangement of the web servers, derived from their enabled flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    None,
    ApacheOnly,
    NginxOnly,
    /// Nginx on the public port proxying to Apache on the internal port
    Hybrid,
}

impl Topology {
    pub fn resolve(apache_enabled: bool, nginx_enabled: bool) -> Self {
        match (apache_enabled, nginx_enabled) {
            (true, true) => Topology::Hybrid,
            (true, false) => Topology::ApacheOnly,
            (false, true) => Topology::NginxOnly,
            (false, false) => Topology::None,
        }
    }

    pub fn runs(&self, server: ModuleKind) -> bool {
        match server {
            ModuleKind::Php => *self != Topology::None,
            ModuleKind::Apache => matches!(self, Topology::ApacheOnly | Topology::Hybrid),
            ModuleKind::Nginx => matches!(self, Topology::NginxOnly | Topology::Hybrid),
            _ => false,
        }
    }

    /// Dependency-first launch order: PHP, then the proxied origin, then the proxy.
    pub fn launch_order(&self) -> Vec<ModuleKind> {
        [ModuleKind::Php, ModuleKind::Apache, ModuleKind::Nginx]
            .into_iter()
            .filter(|kind| self.runs(*kind))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::None => "none",
            Topology::ApacheOnly => "apache-only",
            Topology::NginxOnly => "nginx-only",
            Topology::Hybrid => "hybrid",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Topology::None => "web server disabled",
            Topology::ApacheOnly => "Apache serves directly",
            Topology::NginxOnly => "Nginx serves directly",
            Topology::Hybrid => "Nginx proxies to Apache",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topology plus the concrete installs it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackPlan {
    pub topology: Topology,
    pub php: Option<PhpBinding>,
    pub apache: Option<InstallRef>,
    pub nginx: Option<InstallRef>,
}

impl StackPlan {
    pub fn idle() -> Self {
        Self {
            topology: Topology::None,
            php: None,
            apache: None,
            nginx: None,
        }
    }

    /// Resolve the desired stack. Fails before any process is touched when a
    /// required selection is missing, not installed, or has no parsable version.
    pub fn resolve(preferences: &Preferences, registry: &ModuleRegistry) -> Result<Self> {
        let apache = preferences.module_state(ModuleKind::Apache);
        let nginx = preferences.module_state(ModuleKind::Nginx);
        let topology = Topology::resolve(apache.enabled, nginx.enabled);

        if topology == Topology::None {
            return Ok(Self::idle());
        }

        let selected = |kind: ModuleKind| -> Result<InstallRef> {
            let state = preferences.module_state(kind);
            let version = state.selected_version.ok_or_else(|| PanelError::MissingDependency {
                module: kind,
                detail: format!("no version selected for the {} topology", topology),
            })?;
            registry
                .find(kind, &version)
                .cloned()
                .ok_or(PanelError::VersionNotInstalled {
                    module: kind,
                    version,
                })
        };

        let php = PhpBinding::new(selected(ModuleKind::Php)?)?;
        let apache = if topology.runs(ModuleKind::Apache) {
            Some(selected(ModuleKind::Apache)?)
        } else {
            None
        };
        let nginx = if topology.runs(ModuleKind::Nginx) {
            Some(selected(ModuleKind::Nginx)?)
        } else {
            None
        };

        Ok(Self {
            topology,
            php: Some(php),
            apache,
            nginx,
        })
    }
}
