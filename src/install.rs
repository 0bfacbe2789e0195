//! # Installer and recovery seams.
//!
//! Image writing, partition-table manipulation, and control-plane snapshot
//! access are external collaborators; the sequencer drives them through
//! these traits. The in-memory doubles double as the container-mode
//! implementations, where none of these operations apply.

use async_trait::async_trait;

use crate::error::TaskError;

/// Writes the OS image to disk.
#[async_trait]
pub trait Installer: Send + Sync + 'static {
    /// Whether a prior installation exists on the machine.
    async fn is_installed(&self) -> Result<bool, TaskError>;

    /// Installs `image` to `disk` from scratch.
    async fn install(&self, disk: &str, image: &str) -> Result<(), TaskError>;

    /// Writes `image` to `disk` over an existing installation, optionally
    /// preserving the data partitions.
    async fn upgrade(&self, disk: &str, image: &str, preserve_data: bool) -> Result<(), TaskError>;
}

/// Records install operations instead of performing them.
#[derive(Default)]
pub struct RecordingInstaller {
    installed: std::sync::atomic::AtomicBool,
    calls: std::sync::Mutex<Vec<String>>,
}

impl RecordingInstaller {
    /// Creates the double with a pre-existing installation.
    pub fn installed() -> Self {
        let me = Self::default();
        me.installed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        me
    }

    /// The recorded calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log poisoned").clone()
    }
}

#[async_trait]
impl Installer for RecordingInstaller {
    async fn is_installed(&self) -> Result<bool, TaskError> {
        Ok(self.installed.load(std::sync::atomic::Ordering::SeqCst))
    }

    async fn install(&self, disk: &str, image: &str) -> Result<(), TaskError> {
        self.calls
            .lock()
            .expect("call log poisoned")
            .push(format!("install {disk} {image}"));
        self.installed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn upgrade(&self, disk: &str, image: &str, preserve_data: bool) -> Result<(), TaskError> {
        self.calls
            .lock()
            .expect("call log poisoned")
            .push(format!("upgrade {disk} {image} preserve={preserve_data}"));
        Ok(())
    }
}

/// A control-plane static manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// File name under the manifests directory.
    pub name: String,
    /// File contents.
    pub content: Vec<u8>,
}

/// Source of control-plane static manifests for the Recover sequence
/// (an etcd snapshot or the apiserver).
#[async_trait]
pub trait RecoverySource: Send + Sync + 'static {
    /// Describes the source for logs.
    fn describe(&self) -> String;

    /// Fetches the manifests to restore.
    async fn fetch_manifests(&self) -> Result<Vec<Manifest>, TaskError>;
}

/// A fixed set of manifests, for tests and pre-fetched snapshots.
pub struct StaticRecovery {
    manifests: Vec<Manifest>,
}

impl StaticRecovery {
    /// Wraps a fixed manifest set.
    pub fn new(manifests: Vec<Manifest>) -> Self {
        Self { manifests }
    }
}

#[async_trait]
impl RecoverySource for StaticRecovery {
    fn describe(&self) -> String {
        format!("static snapshot ({} manifests)", self.manifests.len())
    }

    async fn fetch_manifests(&self) -> Result<Vec<Manifest>, TaskError> {
        Ok(self.manifests.clone())
    }
}
