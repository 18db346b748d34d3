//! End-to-end checks against a real GPU.
//!
//!   cargo test -p trtgraph-cuda --features tensorrt -- --ignored

#![cfg(feature = "tensorrt")]

use trtgraph_core::demo;
use trtgraph_core::{
    Backend, CaptureMode, DemoConfig, EngineSource, GraphError, GraphExecutor, HostTensor,
    LogSeverity, Shape,
};
use trtgraph_cuda::{CudaDriver, TrtBackend};

fn backend() -> TrtBackend {
    let driver = CudaDriver::new(0).expect("CUDA device 0");
    TrtBackend::new(driver, LogSeverity::Warning)
}

fn temp_config(dir: &tempfile::TempDir) -> DemoConfig {
    DemoConfig {
        engine_path: dir.path().join("engine.trt"),
        ..DemoConfig::default()
    }
}

#[test]
#[ignore = "requires a CUDA GPU and TensorRT"]
fn build_then_load_returns_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = temp_config(&dir);
    let backend = backend();

    let built = demo::run(&backend, &config).expect("build pass");
    let loaded = demo::run(&backend, &config).expect("load pass");

    assert_eq!(built.source, EngineSource::Built);
    assert_eq!(loaded.source, EngineSource::Loaded);
    for run in built.runs.iter().chain(&loaded.runs) {
        assert_eq!(run.output, run.input);
    }
}

#[test]
#[ignore = "requires a CUDA GPU and TensorRT"]
fn shapes_across_profile_recapture() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = temp_config(&dir);
    let backend = backend();
    let obtained = trtgraph_core::obtain_engine(
        &backend,
        &config.engine_path,
        &config.network(),
        &config.builder_config(),
    )
    .expect("engine");
    let mut context = backend
        .create_execution_context(&obtained.engine)
        .expect("context");
    let mut executor = GraphExecutor::new(
        &backend,
        &obtained.engine,
        &mut context,
        &config.input_profile(),
        CaptureMode::Global,
    )
    .expect("executor");

    for dims in [[1, 1, 1], [6, 8, 10], [3, 4, 5], [3, 4, 5], [2, 7, 1]] {
        let input = HostTensor::arange(Shape::new(dims));
        let output = executor
            .run_once(&mut context, &input.shape, &input.data)
            .expect("run");
        assert_eq!(output, input);
    }
    assert_eq!(executor.stats().captures, 5);

    let err = executor
        .run_once(&mut context, &Shape::new([7, 1, 1]), &[0.0; 7])
        .unwrap_err();
    assert!(matches!(err, GraphError::ShapeOutOfProfile { .. }), "{err}");
}

#[test]
#[ignore = "requires a CUDA GPU and TensorRT"]
fn corrupt_blob_is_load_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = temp_config(&dir);
    std::fs::write(&config.engine_path, b"not an engine").expect("write");

    let err = demo::run(&backend(), &config).err().expect("load must fail");
    assert!(matches!(err, GraphError::EngineLoad { .. }), "{err}");
}
