use crate::backend::{Backend, CaptureMode};
use crate::error::{GraphError, GraphResult};
use crate::network::{IoTensor, TensorIoMode};
use crate::shape::{DataType, OptimizationProfile, Shape};
use crate::tensor::HostTensor;

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Device allocation plus its page-locked host staging twin.
struct TensorSlot<B: Backend> {
    name: String,
    device: B::DeviceBuffer,
    host: B::HostBuffer,
    capacity: usize,
}

impl<B: Backend> TensorSlot<B> {
    fn alloc(backend: &B, name: &str, capacity: usize) -> GraphResult<Self> {
        Ok(Self {
            name: name.to_string(),
            device: backend.alloc_device(capacity)?,
            host: backend.alloc_host(capacity)?,
            capacity,
        })
    }

    fn check_fits(&self, what: &'static str, bytes: usize) -> GraphResult<()> {
        if bytes > self.capacity {
            return Err(GraphError::BufferTooSmall {
                what,
                needed: bytes,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Counters for one executor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub runs: usize,
    pub captures: usize,
    pub launches: usize,
    /// Runs whose shape differed from the previous run's.
    pub shape_changes: usize,
}

// ---------------------------------------------------------------------------
// GraphExecutor
// ---------------------------------------------------------------------------

/// Runs one engine through CUDA Graphs: every `run_once` captures the
/// H2D copy, the inference and the D2H copy on a private stream, then
/// instantiates and launches the captured graph.
///
/// Graphs are never reused. A graph bakes in the shapes and byte counts of
/// its capture window, so each call captures afresh.
///
/// Buffers are sized once for the profile's maximum shape and reused across
/// shapes. The stream and all buffers are released when the executor drops.
pub struct GraphExecutor<'b, B: Backend> {
    backend: &'b B,
    stream: B::Stream,
    input: TensorSlot<B>,
    output: TensorSlot<B>,
    profile: OptimizationProfile,
    capture_mode: CaptureMode,
    last_shape: Option<Shape>,
    stats: ExecutorStats,
}

fn pick_io(io: &[IoTensor], mode: TensorIoMode, name: Option<&str>) -> GraphResult<IoTensor> {
    io.iter()
        .find(|t| t.mode == mode && name.map_or(true, |n| t.name == n))
        .cloned()
        .ok_or_else(|| {
            GraphError::UnknownTensor(match (mode, name) {
                (_, Some(n)) => n.to_string(),
                (TensorIoMode::Input, None) => "<first input>".to_string(),
                (TensorIoMode::Output, None) => "<first output>".to_string(),
            })
        })
}

fn require_float(tensor: &IoTensor) -> GraphResult<()> {
    if tensor.dtype != DataType::Float {
        return Err(GraphError::UnsupportedDataType {
            tensor: tensor.name.clone(),
            dtype: tensor.dtype,
        });
    }
    Ok(())
}

impl<'b, B: Backend> GraphExecutor<'b, B> {
    /// Resolve the profiled input and the first output of `engine`, size
    /// buffers for `profile.max`, and create the stream.
    ///
    /// Leaves `context` bound to the maximum shape.
    pub fn new(
        backend: &'b B,
        engine: &B::Engine,
        context: &mut B::Context,
        profile: &OptimizationProfile,
        capture_mode: CaptureMode,
    ) -> GraphResult<Self> {
        let io = backend.io_tensors(engine)?;
        let input = pick_io(&io, TensorIoMode::Input, Some(&profile.input))?;
        let output = pick_io(&io, TensorIoMode::Output, None)?;
        require_float(&input)?;
        require_float(&output)?;

        backend.set_input_shape(context, &input.name, &profile.max)?;
        let max_output = backend.tensor_shape(context, &output.name)?;
        let input_bytes = profile.max.byte_len(input.dtype)?;
        let output_bytes = max_output.byte_len(output.dtype)?;

        let stream = backend.create_stream()?;
        let input_slot = TensorSlot::alloc(backend, &input.name, input_bytes)?;
        let output_slot = TensorSlot::alloc(backend, &output.name, output_bytes)?;
        tracing::debug!(
            backend = backend.name(),
            input = %input.name,
            output = %output.name,
            input_bytes,
            output_bytes,
            max_shape = %profile.max,
            "allocated executor buffers"
        );

        Ok(Self {
            backend,
            stream,
            input: input_slot,
            output: output_slot,
            profile: profile.clone(),
            capture_mode,
            last_shape: None,
            stats: ExecutorStats::default(),
        })
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
    }

    pub fn input_name(&self) -> &str {
        &self.input.name
    }

    pub fn output_name(&self) -> &str {
        &self.output.name
    }

    pub fn profile(&self) -> &OptimizationProfile {
        &self.profile
    }

    /// Bind `shape`, capture H2D → inference → D2H into a fresh graph,
    /// launch it, wait, and return the output.
    pub fn run_once(
        &mut self,
        context: &mut B::Context,
        shape: &Shape,
        host_input: &[f32],
    ) -> GraphResult<HostTensor> {
        self.profile.check(shape)?;
        let expected = shape.volume();
        if host_input.len() != expected {
            return Err(GraphError::InputLength {
                shape: shape.clone(),
                expected,
                actual: host_input.len(),
            });
        }
        let backend = self.backend;

        backend.set_input_shape(context, &self.input.name, shape)?;
        let output_shape = backend.tensor_shape(context, &self.output.name)?;
        let input_bytes = shape.byte_len(DataType::Float)?;
        let output_bytes = output_shape.byte_len(DataType::Float)?;
        self.input.check_fits("input binding", input_bytes)?;
        self.output.check_fits("output binding", output_bytes)?;

        if let Some(last) = self.last_shape.as_ref().filter(|last| *last != shape) {
            tracing::debug!(from = %last, to = %shape, "input shape changed, recapturing");
            self.stats.shape_changes += 1;
        }

        let staged: Vec<u8> = host_input.iter().flat_map(|v| v.to_ne_bytes()).collect();
        backend.write_host(&mut self.input.host, &staged)?;
        backend.set_tensor_address(context, &self.input.name, &self.input.device)?;
        backend.set_tensor_address(context, &self.output.name, &self.output.device)?;

        let graph = self.capture(context, input_bytes, output_bytes)?;
        let exec = backend.instantiate(&graph)?;
        drop(graph);
        backend.launch(&exec, &self.stream)?;
        backend.synchronize(&self.stream)?;
        self.stats.launches += 1;

        let mut raw = vec![0u8; output_bytes];
        backend.read_host(&self.output.host, &mut raw)?;
        self.stats.runs += 1;
        self.last_shape = Some(shape.clone());
        tracing::info!(shape = %shape, output_shape = %output_shape, "graph launched");
        Ok(HostTensor::from_bytes(output_shape, &raw))
    }

    /// Record the three stream operations. Nothing inside this window may
    /// synchronize the stream. A failed enqueue still ends the capture so the
    /// stream is left usable.
    fn capture(
        &mut self,
        context: &mut B::Context,
        input_bytes: usize,
        output_bytes: usize,
    ) -> GraphResult<B::Graph> {
        let backend = self.backend;
        backend.begin_capture(&self.stream, self.capture_mode)?;
        self.stats.captures += 1;

        let recorded = backend
            .memcpy_htod_async(&self.input.device, &self.input.host, input_bytes, &self.stream)
            .and_then(|()| backend.enqueue(context, &self.stream))
            .and_then(|()| {
                backend.memcpy_dtoh_async(
                    &self.output.host,
                    &self.output.device,
                    output_bytes,
                    &self.stream,
                )
            });

        match recorded {
            Ok(()) => backend.end_capture(&self.stream),
            Err(e) => {
                if let Err(end) = backend.end_capture(&self.stream) {
                    tracing::warn!(error = %end, "failed to end aborted capture");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::reference::ReferenceBackend;
    use crate::test_util::{demo_engine, demo_profile};

    #[test]
    fn identity_at_opt_shape() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        let input = HostTensor::arange(Shape::new([3, 4, 5]));
        let out = exec.run_once(&mut context, &input.shape, &input.data).unwrap();
        assert_eq!(out, input);
        assert_eq!(exec.input_name(), "inputT0");
        assert_eq!(exec.output_name(), "outputT0");
    }

    #[test]
    fn identity_holds_across_profile() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let profile = demo_profile();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &profile, CaptureMode::Global)
                .unwrap();

        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..50 {
            let dims: Vec<usize> = (0..3)
                .map(|i| rng.gen_range(profile.min.dims()[i]..=profile.max.dims()[i]))
                .collect();
            let shape = Shape::new(dims);
            let data: Vec<f32> = (0..shape.volume()).map(|_| rng.gen_range(-1e3..1e3)).collect();
            let out = exec.run_once(&mut context, &shape, &data).unwrap();
            assert_eq!(out.shape, shape);
            assert_eq!(out.data, data, "identity broken at {shape}");
        }
        assert_eq!(exec.stats().runs, 50);
        assert_eq!(exec.stats().captures, 50);
    }

    #[test]
    fn shape_change_recaptures() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        let big = HostTensor::arange(Shape::new([3, 4, 5]));
        exec.run_once(&mut context, &big.shape, &big.data).unwrap();
        let small_data: Vec<f32> = big.data[..24].iter().map(|v| -v).collect();
        let small = exec
            .run_once(&mut context, &Shape::new([2, 3, 4]), &small_data)
            .unwrap();

        assert_eq!(small.shape, Shape::new([2, 3, 4]));
        assert_eq!(small.data, small_data);
        let stats = backend.stats();
        assert_eq!(stats.captures, 2);
        assert_eq!(stats.instantiations, 2);
        assert_eq!(stats.launches, 2);
        assert_eq!(exec.stats().shape_changes, 1);
    }

    #[test]
    fn same_shape_still_recaptures() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        let input = HostTensor::arange(Shape::new([1, 2, 3]));
        for _ in 0..3 {
            exec.run_once(&mut context, &input.shape, &input.data).unwrap();
        }
        assert_eq!(backend.stats().instantiations, 3);
        assert_eq!(exec.stats().shape_changes, 0);
    }

    #[test]
    fn out_of_profile_fails_at_bind() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        let shape = Shape::new([7, 8, 10]);
        let data = vec![0.0; shape.volume()];
        let err = exec.run_once(&mut context, &shape, &data).unwrap_err();
        assert!(matches!(err, GraphError::ShapeOutOfProfile { .. }), "{err}");
        assert_eq!(backend.stats().captures, 0, "nothing captured after a failed bind");
    }

    #[test]
    fn huge_shape_is_rejected_by_profile_before_sizing() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        let shape = Shape::new([usize::MAX, usize::MAX, 1]);
        let err = exec.run_once(&mut context, &shape, &[0.0; 4]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeOutOfProfile { .. }), "{err}");
        assert_eq!(exec.stats().captures, 0);
    }

    #[test]
    fn input_length_is_checked() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        let err = exec
            .run_once(&mut context, &Shape::new([2, 2, 2]), &[1.0; 7])
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::InputLength {
                expected: 8,
                actual: 7,
                ..
            }
        ));
    }

    #[test]
    fn capture_conflict_is_reported_and_recoverable() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let mut exec =
            GraphExecutor::new(&backend, &engine, &mut context, &demo_profile(), CaptureMode::Global)
                .unwrap();

        // Someone else left the stream capturing.
        backend.begin_capture(&exec.stream, CaptureMode::Global).unwrap();
        let input = HostTensor::arange(Shape::new([2, 2, 2]));
        let err = exec
            .run_once(&mut context, &input.shape, &input.data)
            .unwrap_err();
        assert!(matches!(err, GraphError::Capture(_)), "{err}");
        backend.end_capture(&exec.stream).unwrap();

        let out = exec.run_once(&mut context, &input.shape, &input.data).unwrap();
        assert_eq!(out, input);
    }
}
