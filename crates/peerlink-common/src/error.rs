//! Error types for the peerlink network fabric
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants mirror how each failure is handled: malformed input is rejected
//! immediately, pool exhaustion waits for a configuration change, version
//! conflicts are retried with the same mutation, and missing dependencies
//! simply requeue the reconcile.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for peerlink operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// An address could not be parsed
    #[error("invalid address '{input}': {message}")]
    InvalidAddress {
        /// The offending input
        input: String,
        /// Why it was rejected
        message: String,
    },

    /// A CIDR could not be parsed or is otherwise unusable
    #[error("invalid CIDR '{input}': {message}")]
    InvalidCidr {
        /// The offending input
        input: String,
        /// Why it was rejected
        message: String,
    },

    /// No free block of the requested size is left in the network pools
    #[error("network pools exhausted: no free /{prefix_len} block for {cluster}")]
    PoolExhausted {
        /// Prefix length that was requested
        prefix_len: u8,
        /// Cluster the block was requested for
        cluster: String,
    },

    /// A subnet collides with one that is already reserved or allocated
    #[error("subnet {subnet} overlaps {existing}")]
    CidrOverlap {
        /// Subnet that was requested
        subnet: String,
        /// Subnet it collides with
        existing: String,
    },

    /// A network pool cannot be removed while allocations live inside it
    #[error("network pool {pool} is in use by cluster {cluster}")]
    PoolInUse {
        /// Pool that was to be removed
        pool: String,
        /// Cluster holding an allocation inside the pool
        cluster: String,
    },

    /// Optimistic-concurrency collision on the record store
    #[error("version conflict: {message}")]
    Conflict {
        /// Description from the record store
        message: String,
    },

    /// A dependency does not exist yet; reconcile again later
    #[error("{resource} not ready: {message}")]
    NotReady {
        /// The resource being waited on
        resource: String,
        /// What is missing
        message: String,
    },

    /// Tunnel driver or kernel device configuration failed
    #[error("driver error [{backend}]: {message}")]
    Driver {
        /// Backend that failed (e.g. wireguard)
        backend: String,
        /// Description of what failed
        message: String,
    },

    /// Persisting or loading IPAM state failed
    #[error("storage error: {message}")]
    Storage {
        /// Description of what failed
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The IPAM instance was shut down and accepts no further operations
    #[error("IPAM has been shut down")]
    Shutdown,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "gateway")
        context: String,
    },
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                message: ae.message,
            },
            source => Self::Kube { source },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl Error {
    /// Create an invalid-address error
    pub fn invalid_address(input: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-CIDR error
    pub fn invalid_cidr(input: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidCidr {
            input: input.into(),
            message: msg.into(),
        }
    }

    /// Create a pool-exhausted error for a cluster
    pub fn pool_exhausted(prefix_len: u8, cluster: impl Into<String>) -> Self {
        Self::PoolExhausted {
            prefix_len,
            cluster: cluster.into(),
        }
    }

    /// Create an overlap error
    pub fn cidr_overlap(subnet: impl ToString, existing: impl ToString) -> Self {
        Self::CidrOverlap {
            subnet: subnet.to_string(),
            existing: existing.to_string(),
        }
    }

    /// Create a version-conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a not-ready error for a resource
    pub fn not_ready(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a driver error for a backend
    pub fn driver(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Driver {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
        }
    }

    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed input and configuration errors are not retryable (they
    /// require a spec or pool change). Conflicts, missing dependencies and
    /// driver failures are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::InvalidAddress { .. } => false,
            Error::InvalidCidr { .. } => false,
            Error::PoolExhausted { .. } => false,
            Error::CidrOverlap { .. } => false,
            Error::PoolInUse { .. } => false,
            Error::Conflict { .. } => true,
            Error::NotReady { .. } => true,
            Error::Driver { .. } => true,
            Error::Storage { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Shutdown => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for optimistic-concurrency collisions
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when a dependency is missing and the caller should simply retry later
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
