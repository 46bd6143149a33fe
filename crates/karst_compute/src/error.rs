use thiserror::Error;

/// Failures surfaced by the compute primitives and the managers built on
/// them. Construction-time errors abort the frame; traversal never fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("{what}: length {value} is not a power of two")]
    NotPowerOfTwo { what: &'static str, value: usize },

    #[error("kernel `{kernel}` needs {needed} bytes of local memory, device exposes {available}")]
    InsufficientLocalMemory {
        kernel: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("kernel `{kernel}` failed during {stage}")]
    Kernel {
        kernel: &'static str,
        stage: &'static str,
    },

    #[error("`{operation}` requires `{prerequisite}` to have run first")]
    OutOfOrder {
        operation: &'static str,
        prerequisite: &'static str,
    },
}

pub type ComputeResult<T> = Result<T, ComputeError>;
