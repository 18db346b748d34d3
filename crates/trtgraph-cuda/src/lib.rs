//! CUDA driver bindings and the TensorRT backend for `trtgraph-core`.
//!
//! The driver API is always available (loaded at runtime). The TensorRT
//! backend needs the `tensorrt` feature, which compiles `cpp/trt_shim.cpp`
//! and links `libnvinfer`.

pub mod driver;
pub mod tensorrt;

pub use driver::{CudaDriver, CudaGraph, CudaGraphExec, CudaStream, DeviceBuffer, PinnedBuffer};
#[cfg(feature = "tensorrt")]
pub use tensorrt::{tensorrt_version, TrtBackend, TrtContext, TrtEngine};
