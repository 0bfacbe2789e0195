//! Errors produced by the resource store.

use thiserror::Error;

/// # Errors returned by [`Store`](super::Store) operations.
///
/// `Conflict` and `NotFound` are retried or swallowed by controllers inside a
/// reconciliation pass; the remaining kinds indicate misuse and propagate.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No resource exists at `(namespace, type, id)`.
    #[error("resource {namespace}/{ty}/{id} not found")]
    NotFound {
        /// Namespace of the missing resource.
        namespace: String,
        /// Type of the missing resource.
        ty: &'static str,
        /// Id of the missing resource.
        id: String,
    },

    /// A resource already exists at `(namespace, type, id)`.
    #[error("resource {namespace}/{ty}/{id} already exists")]
    AlreadyExists {
        /// Namespace of the duplicate resource.
        namespace: String,
        /// Type of the duplicate resource.
        ty: &'static str,
        /// Id of the duplicate resource.
        id: String,
    },

    /// CAS mismatch: the resource moved past the expected version.
    #[error("version conflict on {namespace}/{ty}/{id}: expected {expected}, current {current}")]
    Conflict {
        /// Namespace of the contended resource.
        namespace: String,
        /// Type of the contended resource.
        ty: &'static str,
        /// Id of the contended resource.
        id: String,
        /// The version the writer expected.
        expected: u64,
        /// The version actually stored.
        current: u64,
    },

    /// Destruction is blocked while the finalizer set is non-empty.
    #[error("resource {namespace}/{ty}/{id} has finalizers: {finalizers:?}")]
    HasFinalizers {
        /// Namespace of the resource.
        namespace: String,
        /// Type of the resource.
        ty: &'static str,
        /// Id of the resource.
        id: String,
        /// The finalizers still registered.
        finalizers: Vec<String>,
    },

    /// A writer attempted to mutate a resource owned by another controller.
    #[error("resource {namespace}/{ty}/{id} is owned by '{owner}', writer is '{writer}'")]
    OwnerMismatch {
        /// Namespace of the resource.
        namespace: String,
        /// Type of the resource.
        ty: &'static str,
        /// Id of the resource.
        id: String,
        /// The registered owner.
        owner: String,
        /// The rejected writer.
        writer: String,
    },
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::AlreadyExists { .. } => "store_already_exists",
            StoreError::Conflict { .. } => "store_conflict",
            StoreError::HasFinalizers { .. } => "store_has_finalizers",
            StoreError::OwnerMismatch { .. } => "store_owner_mismatch",
        }
    }

    /// `NotFound` is a missing precondition for controllers: swallow and wait
    /// for the next event.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// `Conflict` is retried within the reconciliation pass.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
