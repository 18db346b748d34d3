//! Build (or load) an identity TensorRT engine with a dynamic input shape,
//! then run it for two shapes through freshly captured CUDA Graphs.
//!
//! The first pass finds no persisted engine, builds and saves it; the second
//! pass loads it back. Both print the outputs for shapes (3, 4, 5) and
//! (2, 3, 4).
//!
//! Usage:
//!   # TensorRT on GPU (requires TENSORRT_ROOT, libnvinfer and a CUDA driver)
//!   cargo run --release -p trtgraph-cuda --features tensorrt --bin cuda_graph_demo
//!
//!   # Host reference backend, no GPU needed
//!   cargo run --release -p trtgraph-cuda --bin cuda_graph_demo
//!
//! Set RUST_LOG (e.g. `RUST_LOG=debug,tensorrt=info`) for more detail.

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use trtgraph_core::demo;
use trtgraph_core::{clear_persisted_engines, Backend, DemoConfig, ENGINE_EXTENSION};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DemoConfig::default();
    let removed = clear_persisted_engines(config.engine_dir(), ENGINE_EXTENSION)
        .with_context(|| format!("clearing {}", config.engine_dir().display()))?;
    tracing::info!(removed, dir = %config.engine_dir().display(), "cleared persisted engines");

    run_with_device(&config)
}

#[cfg(feature = "tensorrt")]
fn run_with_device(config: &DemoConfig) -> anyhow::Result<()> {
    let driver =
        trtgraph_cuda::CudaDriver::new(config.device_ordinal).context("initialising CUDA device")?;
    let backend = trtgraph_cuda::TrtBackend::new(driver, config.log_severity);
    run_twice(&backend, config)
}

#[cfg(not(feature = "tensorrt"))]
fn run_with_device(config: &DemoConfig) -> anyhow::Result<()> {
    tracing::warn!("built without the tensorrt feature; using the host reference backend");
    let backend = trtgraph_core::ReferenceBackend::new();
    run_twice(&backend, config)
}

fn run_twice<B: Backend>(backend: &B, config: &DemoConfig) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    demo::run_twice(backend, config, &mut stdout.lock()).context("running captured inference")
}
