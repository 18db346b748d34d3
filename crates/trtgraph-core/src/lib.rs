pub mod backend;
pub mod config;
pub mod demo;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod network;
pub mod reference;
pub mod shape;
pub mod tensor;

#[cfg(test)]
pub(crate) mod test_util;

pub use backend::{Backend, CaptureMode};
pub use config::{DemoConfig, ENGINE_EXTENSION};
pub use error::{GraphError, GraphResult};
pub use executor::{ExecutorStats, GraphExecutor};
pub use lifecycle::{clear_persisted_engines, obtain_engine, EngineSource, ObtainedEngine};
pub use network::{
    BuilderConfig, IoTensor, Layer, LogSeverity, NetworkDefinition, TensorDecl, TensorIoMode,
};
pub use reference::{ReferenceBackend, ReferenceStats};
pub use shape::{DataType, Dims, OptimizationProfile, Shape, DYNAMIC};
pub use tensor::HostTensor;
