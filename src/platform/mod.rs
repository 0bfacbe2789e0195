//! # Platform adapters.
//!
//! The single dynamic-dispatch point for per-environment behavior: where the
//! machine configuration comes from, what the metadata service knows, and
//! which extra kernel arguments apply. The adapter is selected once at
//! startup from the `talos.platform` cmdline value; cloud adapters (AWS,
//! Azure, GCP, VMware) are external collaborators implementing the same
//! trait.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::TaskError;
use crate::machine::{Cmdline, CONFIG_KEY, PLATFORM_KEY};

/// Broad runtime environment of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMode {
    /// Running inside a container; the host owns kernel and power state.
    Container,
    /// Running on a cloud instance with a metadata service.
    Cloud,
    /// Running on bare metal.
    Metal,
}

impl fmt::Display for PlatformMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformMode::Container => f.write_str("container"),
            PlatformMode::Cloud => f.write_str("cloud"),
            PlatformMode::Metal => f.write_str("metal"),
        }
    }
}

/// Per-environment capability.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Adapter name (`metal`, `container`, `aws`, ...).
    fn name(&self) -> &'static str;

    /// Broad runtime environment.
    fn mode(&self) -> PlatformMode;

    /// Fetches the machine configuration; `None` when the platform does not
    /// provide one.
    async fn configuration(&self) -> Result<Option<Vec<u8>>, TaskError>;

    /// Platform-assigned hostname, if any.
    async fn hostname(&self) -> Result<Option<String>, TaskError>;

    /// Externally visible addresses, if the platform knows them.
    async fn external_ips(&self) -> Result<Vec<IpAddr>, TaskError>;

    /// Extra kernel arguments the platform requires.
    fn kernel_args(&self) -> Vec<String>;
}

/// Bare-metal adapter: the configuration comes from the `talos.config`
/// cmdline value (a local path in this build; remote fetching is an external
/// collaborator).
pub struct Metal {
    config_source: Option<String>,
}

impl Metal {
    /// Creates the adapter with an optional configuration source.
    pub fn new(config_source: Option<String>) -> Self {
        Self { config_source }
    }
}

#[async_trait]
impl Platform for Metal {
    fn name(&self) -> &'static str {
        "metal"
    }

    fn mode(&self) -> PlatformMode {
        PlatformMode::Metal
    }

    async fn configuration(&self) -> Result<Option<Vec<u8>>, TaskError> {
        let Some(source) = &self.config_source else {
            return Ok(None);
        };

        let path = source.strip_prefix("file://").unwrap_or(source);

        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(source = %source, "no configuration at source yet");
                Ok(None)
            }
            Err(e) => Err(TaskError::transient(format!("reading {source}: {e}"))),
        }
    }

    async fn hostname(&self) -> Result<Option<String>, TaskError> {
        Ok(None)
    }

    async fn external_ips(&self) -> Result<Vec<IpAddr>, TaskError> {
        Ok(Vec::new())
    }

    fn kernel_args(&self) -> Vec<String> {
        vec!["console=ttyS0".to_string()]
    }
}

/// Container adapter: no kernel ownership, no platform configuration.
#[derive(Default)]
pub struct Container;

#[async_trait]
impl Platform for Container {
    fn name(&self) -> &'static str {
        "container"
    }

    fn mode(&self) -> PlatformMode {
        PlatformMode::Container
    }

    async fn configuration(&self) -> Result<Option<Vec<u8>>, TaskError> {
        Ok(None)
    }

    async fn hostname(&self) -> Result<Option<String>, TaskError> {
        Ok(None)
    }

    async fn external_ips(&self) -> Result<Vec<IpAddr>, TaskError> {
        Ok(Vec::new())
    }

    fn kernel_args(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Selects the platform adapter from the kernel cmdline.
pub fn select(cmdline: &Cmdline) -> Arc<dyn Platform> {
    match cmdline.get(PLATFORM_KEY) {
        Some("container") => Arc::new(Container),
        _ => Arc::new(Metal::new(
            cmdline.get(CONFIG_KEY).map(str::to_string),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_by_cmdline() {
        let p = select(&Cmdline::parse("talos.platform=container"));
        assert_eq!(p.name(), "container");
        assert_eq!(p.mode(), PlatformMode::Container);

        let p = select(&Cmdline::parse("talos.platform=metal talos.config=/cfg.yaml"));
        assert_eq!(p.name(), "metal");
        assert_eq!(p.mode(), PlatformMode::Metal);
    }

    #[tokio::test]
    async fn metal_reads_local_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, b"version: v1alpha1\n").await.unwrap();

        let platform = Metal::new(Some(format!("file://{}", path.display())));
        let bytes = platform.configuration().await.unwrap().unwrap();
        assert_eq!(bytes, b"version: v1alpha1\n");

        let missing = Metal::new(Some("/nonexistent/config.yaml".to_string()));
        assert!(missing.configuration().await.unwrap().is_none());
    }
}
