//! Resource metadata: identity, versioning, ownership, and lifecycle phase.

use std::fmt;
use std::time::SystemTime;

/// Lifecycle phase of a resource.
///
/// Destruction is two-phase: a resource with finalizers is first marked
/// `TearingDown`; claimants observe the phase change, undo their side
/// effects, and drop their finalizers; only then is the resource removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The resource is live and reconciled.
    Running,
    /// Destruction was requested; waiting for finalizers to drain.
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearing-down"),
        }
    }
}

/// Precedence tier for desired-state specs.
///
/// When multiple layers produce the same logical key (e.g. an address on
/// `lo`), the highest layer wins; lower-layer specs are retained but ignored
/// by the applier. Resource IDs carry the layer prefix so specs from
/// different layers stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigLayer {
    /// Built-in defaults (loopback up, loopback addresses).
    Default,
    /// Parsed from the kernel command line (`ip=`).
    Cmdline,
    /// Supplied by the platform adapter (cloud metadata).
    Platform,
    /// Pushed by an operator through the management API.
    Operator,
    /// The authoritative machine configuration document.
    MachineConfig,
}

impl ConfigLayer {
    /// Returns the ID prefix for this layer.
    pub fn prefix(&self) -> &'static str {
        match self {
            ConfigLayer::Default => "default",
            ConfigLayer::Cmdline => "cmdline",
            ConfigLayer::Platform => "platform",
            ConfigLayer::Operator => "operator",
            ConfigLayer::MachineConfig => "configuration",
        }
    }

    /// Builds a layered resource ID: `<prefix>/<logical-id>`.
    pub fn layered_id(&self, logical: impl AsRef<str>) -> String {
        format!("{}/{}", self.prefix(), logical.as_ref())
    }
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Metadata attached to every resource.
///
/// `(namespace, type, id)` is unique within the store; `version` increments
/// on every mutation; destruction is blocked while `finalizers` is non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Namespace the resource lives in.
    pub namespace: String,
    /// Type name of the resource.
    pub ty: &'static str,
    /// Id, unique within `(namespace, type)`.
    pub id: String,
    /// Monotonic version, starting at 1 on creation.
    pub version: u64,
    /// Name of the owning controller, or empty for externally-written
    /// resources.
    pub owner: String,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Ordered set of finalizers blocking destruction.
    pub finalizers: Vec<String>,
    /// Creation timestamp.
    pub created: SystemTime,
    /// Last mutation timestamp.
    pub updated: SystemTime,
}

impl Metadata {
    /// Creates metadata for a new, unversioned resource.
    pub fn new(namespace: impl Into<String>, ty: &'static str, id: impl Into<String>) -> Self {
        let now = SystemTime::now();

        Self {
            namespace: namespace.into(),
            ty,
            id: id.into(),
            version: 0,
            owner: String::new(),
            phase: Phase::Running,
            finalizers: Vec::new(),
            created: now,
            updated: now,
        }
    }

    /// Adds a finalizer if not already present; returns whether it was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.finalizers.iter().any(|f| f == finalizer) {
            return false;
        }

        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes a finalizer if present; returns whether it was removed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}@{}", self.namespace, self.ty, self.id, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_precedence_order() {
        assert!(ConfigLayer::Default < ConfigLayer::Cmdline);
        assert!(ConfigLayer::Cmdline < ConfigLayer::Platform);
        assert!(ConfigLayer::Platform < ConfigLayer::Operator);
        assert!(ConfigLayer::Operator < ConfigLayer::MachineConfig);
    }

    #[test]
    fn layered_ids() {
        assert_eq!(
            ConfigLayer::Default.layered_id("lo/127.0.0.1/8"),
            "default/lo/127.0.0.1/8"
        );
        assert_eq!(
            ConfigLayer::MachineConfig.layered_id("eth0.24/10.0.0.1/8"),
            "configuration/eth0.24/10.0.0.1/8"
        );
    }

    #[test]
    fn finalizers_are_a_set() {
        let mut meta = Metadata::new("network-config", "LinkSpec", "default/lo");

        assert!(meta.add_finalizer("applier"));
        assert!(!meta.add_finalizer("applier"));
        assert!(meta.remove_finalizer("applier"));
        assert!(!meta.remove_finalizer("applier"));
        assert!(meta.finalizers.is_empty());
    }
}
