use std::path::PathBuf;

use thiserror::Error;

use crate::shape::{DataType, Shape};

pub type GraphResult<T> = Result<T, GraphError>;

/// Failure at the orchestration/vendor boundary.
///
/// Vendor status codes are mapped into these kinds where the call is made,
/// so the caller decides on cleanup and reporting instead of the process
/// dying inside a native library.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to deserialize engine from {}", path.display())]
    EngineLoad { path: PathBuf },

    #[error("engine build produced no serialized network: {reason}")]
    EngineBuild { reason: String },

    #[error("shape {shape} for tensor '{tensor}' is outside the optimization profile [{min} .. {max}]")]
    ShapeOutOfProfile {
        tensor: String,
        shape: Shape,
        min: Shape,
        max: Shape,
    },

    #[error("tensor '{tensor}' expects rank {expected}, got rank {actual}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid optimization profile for '{tensor}': {reason}")]
    InvalidProfile { tensor: String, reason: String },

    #[error("host input holds {actual} elements but shape {shape} needs {expected}")]
    InputLength {
        shape: Shape,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{tensor}' has data type {dtype:?}; only Float host tensors are supported")]
    UnsupportedDataType { tensor: String, dtype: DataType },

    #[error("{what} needs {needed} bytes but the buffer holds {capacity}")]
    BufferTooSmall {
        what: &'static str,
        needed: usize,
        capacity: usize,
    },

    #[error("shape {shape} holds more elements than fit in memory")]
    ShapeTooLarge { shape: Shape },

    #[error("engine has no tensor named '{0}'")]
    UnknownTensor(String),

    #[error("stream capture: {0}")]
    Capture(String),

    #[error("CUDA driver call {op} failed: {name} ({code})")]
    Driver {
        op: &'static str,
        code: i32,
        name: String,
    },

    #[error("TensorRT {op} failed: {message}")]
    TensorRt { op: &'static str, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GraphError {
    pub fn capture(message: impl Into<String>) -> Self {
        GraphError::Capture(message.into())
    }

    pub fn tensorrt(op: &'static str, message: impl Into<String>) -> Self {
        GraphError::TensorRt {
            op,
            message: message.into(),
        }
    }

    /// True for the two checked engine failures that end a run with a
    /// status line rather than an error exit.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(
            self,
            GraphError::EngineLoad { .. } | GraphError::EngineBuild { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_failures_are_flagged() {
        let load = GraphError::EngineLoad {
            path: PathBuf::from("engine.trt"),
        };
        let build = GraphError::EngineBuild {
            reason: "no outputs".into(),
        };
        assert!(load.is_engine_unavailable());
        assert!(build.is_engine_unavailable());
        assert!(!GraphError::capture("nested").is_engine_unavailable());
    }

    #[test]
    fn shape_error_names_bounds() {
        let err = GraphError::ShapeOutOfProfile {
            tensor: "inputT0".into(),
            shape: Shape::new([7, 1, 1]),
            min: Shape::new([1, 1, 1]),
            max: Shape::new([6, 8, 10]),
        };
        let msg = err.to_string();
        assert!(msg.contains("(7, 1, 1)"), "{msg}");
        assert!(msg.contains("(6, 8, 10)"), "{msg}");
    }
}
