use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;

/// Type-erased item flowing between pipeline stages
pub type Payload = Box<dyn Any + Send>;

/// Runtime tag for a stage's declared input or output type
#[derive(Debug, Clone, Copy)]
pub enum TypeTag {
    /// A concrete Rust type
    Known { id: TypeId, name: &'static str },
    /// A stage that accepts or produces values whose type cannot be named
    Opaque { name: &'static str },
}

/// Outcome of comparing two type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible,
    /// At least one side is opaque; the check cannot be resolved
    Unknown,
}

impl TypeTag {
    pub fn of<T: Any>() -> Self {
        TypeTag::Known {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn opaque(name: &'static str) -> Self {
        TypeTag::Opaque { name }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::Known { name, .. } | TypeTag::Opaque { name } => name,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, TypeTag::Opaque { .. })
    }

    /// Whether a value tagged `self` can be fed where `target` is expected
    pub fn compatibility(&self, target: &TypeTag) -> Compatibility {
        match (self, target) {
            (TypeTag::Known { id: a, .. }, TypeTag::Known { id: b, .. }) => {
                if a == b {
                    Compatibility::Compatible
                } else {
                    Compatibility::Incompatible
                }
            }
            _ => Compatibility::Unknown,
        }
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TypeTag::Known { id: a, .. }, TypeTag::Known { id: b, .. }) => a == b,
            (TypeTag::Opaque { name: a }, TypeTag::Opaque { name: b }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Known { name, .. } => write!(f, "{}", name),
            TypeTag::Opaque { name } => write!(f, "<{}>", name),
        }
    }
}

/// Lifecycle of a batching stage. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShutdownState {
    Running,
    ShutdownRequested,
    ShutdownComplete,
}

impl ShutdownState {
    pub fn is_running(&self) -> bool {
        matches!(self, ShutdownState::Running)
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShutdownState::Running => "running",
            ShutdownState::ShutdownRequested => "shutdown_requested",
            ShutdownState::ShutdownComplete => "shutdown_complete",
        };
        write!(f, "{}", label)
    }
}

/// Lifecycle of a processing exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExporterState {
    Idle,
    Running,
    Stopping,
    Stopped,
}
