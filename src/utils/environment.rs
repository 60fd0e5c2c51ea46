// src/utils/environment.rs: container runtime presence, liveness and image checks

use std::env;

use log::{info, warn};
use serde::Serialize;

use crate::utils::command::{capture, CommandSpec, ExitOutcome};

/// Result of the ordered environment check. `message` is the single instruction to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentReport {
    pub installed: bool,
    pub live: bool,
    pub image_available: bool,
    pub message: String,
}

impl EnvironmentReport {
    pub fn is_ready(&self) -> bool {
        self.installed && self.live && self.image_available
    }
}

#[derive(Debug, Clone)]
pub struct Gatekeeper {
    runtime: String,
    image: String,
}

impl Gatekeeper {
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        Gatekeeper {
            runtime: runtime.into(),
            image: image.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn runtime_command<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> CommandSpec {
        let cwd = env::temp_dir();
        CommandSpec::new(self.runtime.clone(), cwd).args(args)
    }

    async fn probe<'a>(&self, what: &str, args: impl IntoIterator<Item = &'a str>) -> bool {
        match capture(&self.runtime_command(args)).await {
            ExitOutcome::Success { .. } => true,
            outcome => {
                let reason = outcome.failure_message().unwrap_or_default();
                warn!("{} check failed for {}: {}", what, self.runtime, reason.trim());
                false
            }
        }
    }

    pub async fn is_runtime_installed(&self) -> bool {
        self.probe("Installation", ["--version"]).await
    }

    pub async fn is_runtime_live(&self) -> bool {
        self.probe("Liveness", ["info"]).await
    }

    pub async fn is_required_image_available(&self, name: &str) -> bool {
        self.probe("Image", ["image", "inspect", name]).await
    }

    /// Pulls `name` unless it is already present.
    ///
    /// # Arguments
    ///
    /// * `name` - Image reference to acquire.
    ///
    /// # Returns
    /// true once the image is available locally.
    pub async fn ensure_image_available(&self, name: &str) -> bool {
        if self.is_required_image_available(name).await {
            return true;
        }
        info!("Pulling image {} with {}", name, self.runtime);
        if !self.probe("Pull", ["pull", name]).await {
            return false;
        }
        self.is_required_image_available(name).await
    }

    /// Installed, live, image present: checked in that order, stopping at the first failure.
    pub async fn full_environment_check(&self) -> EnvironmentReport {
        let mut report = EnvironmentReport {
            installed: false,
            live: false,
            image_available: false,
            message: String::new(),
        };

        report.installed = self.is_runtime_installed().await;
        if !report.installed {
            report.message = format!("{} is not installed. Install it and try again.", self.runtime);
            return report;
        }

        report.live = self.is_runtime_live().await;
        if !report.live {
            report.message = format!("{} is installed but not running. Start it and try again.", self.runtime);
            return report;
        }

        report.image_available = self.is_required_image_available(&self.image).await;
        if !report.image_available {
            report.message = format!("Image {} is not available. Pull it before starting an analysis.", self.image);
            return report;
        }

        report.message = "Execution environment ready".to_string();
        report
    }
}
