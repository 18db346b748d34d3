//! The build-then-load demonstration: obtain an engine, then run one
//! graph-captured inference per configured shape.

use std::io::Write;

use crate::backend::Backend;
use crate::config::DemoConfig;
use crate::error::{GraphError, GraphResult};
use crate::executor::{ExecutorStats, GraphExecutor};
use crate::lifecycle::{obtain_engine, EngineSource};
use crate::shape::Shape;
use crate::tensor::HostTensor;

/// One inference of a demo run.
pub struct ShapeRun {
    pub input: HostTensor,
    pub output: HostTensor,
}

/// Everything a demo run produced.
pub struct DemoRun {
    pub source: EngineSource,
    pub blob_bytes: usize,
    pub fingerprint: String,
    pub runs: Vec<ShapeRun>,
    pub stats: ExecutorStats,
}

/// The first shape gets `0, 1, 2, ...`; later shapes get `0, -1, -2, ...`,
/// i.e. the negated prefix of the first input.
pub fn demo_inputs(shapes: &[Shape]) -> Vec<HostTensor> {
    shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            if i == 0 {
                HostTensor::arange(shape.clone())
            } else {
                let data = (0..shape.volume()).map(|k| -(k as f32)).collect();
                HostTensor::new(shape.clone(), data)
            }
        })
        .collect()
}

/// Label printed before each output.
pub fn output_label(index: usize) -> String {
    match index {
        0 => "outputH0Big".to_string(),
        1 => "outputH0Small".to_string(),
        n => format!("outputH0[{n}]"),
    }
}

/// Obtain the engine at `config.engine_path` (building and persisting it
/// if absent) and run every configured shape through a fresh capture.
///
/// Resources are dropped in reverse order of creation: executor (stream,
/// buffers), then context, then engine.
pub fn run<B: Backend>(backend: &B, config: &DemoConfig) -> GraphResult<DemoRun> {
    let obtained = obtain_engine(
        backend,
        &config.engine_path,
        &config.network(),
        &config.builder_config(),
    )?;
    let fingerprint = obtained.short_fingerprint();
    tracing::info!(
        source = ?obtained.source,
        bytes = obtained.blob_bytes,
        %fingerprint,
        "engine ready"
    );

    let engine = obtained.engine;
    let mut context = backend.create_execution_context(&engine)?;
    let mut executor = GraphExecutor::new(
        backend,
        &engine,
        &mut context,
        &config.input_profile(),
        config.capture_mode,
    )?;

    let mut runs = Vec::with_capacity(config.shapes.len());
    for input in demo_inputs(&config.shapes) {
        let output = executor.run_once(&mut context, &input.shape, &input.data)?;
        runs.push(ShapeRun { input, output });
    }

    Ok(DemoRun {
        source: obtained.source,
        blob_bytes: obtained.blob_bytes,
        fingerprint,
        runs,
        stats: executor.stats(),
    })
}

/// One reported pass: run the demonstration and print its status line and
/// outputs to `out`.
///
/// A failed build or load prints `Failed building engine!` or
/// `Failed loading engine!` and returns `Ok(None)`; any other error is
/// returned to the caller.
pub fn run_and_report<B: Backend, W: Write>(
    backend: &B,
    config: &DemoConfig,
    out: &mut W,
) -> GraphResult<Option<DemoRun>> {
    let run = match run(backend, config) {
        Ok(run) => run,
        Err(GraphError::EngineBuild { reason }) => {
            tracing::error!(%reason, "engine build failed");
            writeln!(out, "Failed building engine!")?;
            return Ok(None);
        }
        Err(err @ GraphError::EngineLoad { .. }) => {
            tracing::error!(%err, "engine load failed");
            writeln!(out, "Failed loading engine!")?;
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    match run.source {
        EngineSource::Built => writeln!(out, "Succeeded building engine!")?,
        EngineSource::Loaded => writeln!(out, "Succeeded loading engine!")?,
    }
    for (i, shape_run) in run.runs.iter().enumerate() {
        writeln!(out, "{}: {}", output_label(i), shape_run.output.shape)?;
        writeln!(out, "{}", shape_run.output)?;
    }
    tracing::info!(
        fingerprint = %run.fingerprint,
        bytes = run.blob_bytes,
        captures = run.stats.captures,
        launches = run.stats.launches,
        "demonstration pass complete"
    );
    Ok(Some(run))
}

/// Two passes in a row: the first normally builds and persists the engine,
/// the second loads it. A pass that cannot obtain an engine does not stop
/// the next one.
pub fn run_twice<B: Backend, W: Write>(
    backend: &B,
    config: &DemoConfig,
    out: &mut W,
) -> GraphResult<()> {
    for _ in 0..2 {
        run_and_report(backend, config, out)?;
    }
    Ok(())
}
