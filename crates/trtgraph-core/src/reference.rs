//! Host-memory backend with CUDA stream-capture semantics.
//!
//! Device and pinned memory are plain byte vectors. Work issued outside a
//! capture runs immediately; work issued inside a capture is recorded and
//! replayed by `launch`. The "engine" is a serialized network description
//! evaluated on the host, which is enough to exercise the whole
//! build/persist/load/capture/launch sequence without a GPU.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, CaptureMode};
use crate::error::{GraphError, GraphResult};
use crate::network::{BuilderConfig, IoTensor, NetworkDefinition, TensorIoMode};
use crate::shape::Shape;

type Memory = Rc<RefCell<Vec<u8>>>;

/// Leading bytes of a reference engine blob.
const PLAN_MAGIC: [u8; 8] = *b"TRTGREF1";

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

pub struct RefDeviceBuffer(Memory);

pub struct RefHostBuffer(Memory);

impl RefDeviceBuffer {
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct CopyOp {
    dst: Memory,
    src: Memory,
    bytes: usize,
}

impl CopyOp {
    fn run(&self) {
        let data = self.src.borrow()[..self.bytes].to_vec();
        self.dst.borrow_mut()[..self.bytes].copy_from_slice(&data);
    }
}

#[derive(Clone)]
enum StreamOp {
    Memcpy(CopyOp),
    /// One inference: a copy per output tensor for identity networks.
    Kernel(Vec<CopyOp>),
}

impl StreamOp {
    fn run(&self) {
        match self {
            StreamOp::Memcpy(op) => op.run(),
            StreamOp::Kernel(ops) => ops.iter().for_each(CopyOp::run),
        }
    }
}

enum CaptureState {
    Idle,
    Capturing { mode: CaptureMode, ops: Vec<StreamOp> },
    /// A forbidden call was made while capturing; only `end_capture` is
    /// accepted, and it fails.
    Invalidated,
}

pub struct RefStream {
    state: RefCell<CaptureState>,
    /// Shared with the backend; an open global capture holds one count.
    global_captures: Rc<Cell<usize>>,
}

impl RefStream {
    fn release_global(&self) {
        self.global_captures.set(self.global_captures.get() - 1);
    }
}

impl Drop for RefStream {
    fn drop(&mut self) {
        let open_global = matches!(
            self.state.get_mut(),
            CaptureState::Capturing {
                mode: CaptureMode::Global,
                ..
            }
        );
        if open_global {
            self.release_global();
        }
    }
}

pub struct RefGraph {
    ops: Vec<StreamOp>,
}

impl RefGraph {
    pub fn node_count(&self) -> usize {
        self.ops.len()
    }
}

pub struct RefGraphExec {
    ops: Vec<StreamOp>,
}

#[derive(Serialize, Deserialize)]
struct EnginePlan {
    network: NetworkDefinition,
    builder: BuilderConfig,
}

pub struct RefEngine {
    plan: EnginePlan,
    io: Vec<IoTensor>,
}

pub struct RefContext {
    engine: Rc<RefEngine>,
    shapes: HashMap<String, Shape>,
    addresses: HashMap<String, Memory>,
}

/// Counters over the backend's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    pub streams: usize,
    pub captures: usize,
    pub instantiations: usize,
    pub launches: usize,
    pub synchronizations: usize,
    pub engines_built: usize,
    pub engines_deserialized: usize,
}

// ---------------------------------------------------------------------------
// ReferenceBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ReferenceBackend {
    stats: Cell<ReferenceStats>,
    global_captures: Rc<Cell<usize>>,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ReferenceStats {
        self.stats.get()
    }

    fn bump(&self, f: impl FnOnce(&mut ReferenceStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Allocation is an unsafe call while a global-mode capture is open.
    fn check_alloc_allowed(&self, what: &str) -> GraphResult<()> {
        if self.global_captures.get() > 0 {
            return Err(GraphError::capture(format!(
                "{what} is not permitted while a global-mode capture is in progress"
            )));
        }
        Ok(())
    }

    /// Execute now, or record when the stream is capturing.
    fn submit(&self, stream: &RefStream, op: StreamOp) -> GraphResult<()> {
        match &mut *stream.state.borrow_mut() {
            CaptureState::Idle => {
                op.run();
                Ok(())
            }
            CaptureState::Capturing { ops, .. } => {
                ops.push(op);
                Ok(())
            }
            CaptureState::Invalidated => Err(GraphError::capture(
                "stream capture was invalidated; end the capture first",
            )),
        }
    }

    fn copy_op(dst: &Memory, src: &Memory, bytes: usize, what: &'static str) -> GraphResult<CopyOp> {
        let capacity = dst.borrow().len().min(src.borrow().len());
        if bytes > capacity {
            return Err(GraphError::BufferTooSmall {
                what,
                needed: bytes,
                capacity,
            });
        }
        Ok(CopyOp {
            dst: Rc::clone(dst),
            src: Rc::clone(src),
            bytes,
        })
    }

    fn engine_from_plan(plan: EnginePlan) -> Result<RefEngine, String> {
        plan.network.validate(&plan.builder)?;
        let mut io: Vec<IoTensor> = plan
            .network
            .inputs
            .iter()
            .map(|t| IoTensor {
                name: t.name.clone(),
                mode: TensorIoMode::Input,
                dtype: t.dtype,
            })
            .collect();
        let sources = plan.network.sources();
        for output in &plan.network.outputs {
            let source = sources
                .get(output.as_str())
                .and_then(|root| plan.network.input(root))
                .ok_or_else(|| format!("output '{output}' is not derived from an input"))?;
            io.push(IoTensor {
                name: output.clone(),
                mode: TensorIoMode::Output,
                dtype: source.dtype,
            });
        }
        Ok(RefEngine { plan, io })
    }
}

impl Backend for ReferenceBackend {
    type Stream = RefStream;
    type DeviceBuffer = RefDeviceBuffer;
    type HostBuffer = RefHostBuffer;
    type Graph = RefGraph;
    type GraphExec = RefGraphExec;
    type Engine = Rc<RefEngine>;
    type Context = RefContext;

    fn name(&self) -> &'static str {
        "reference"
    }

    fn create_stream(&self) -> GraphResult<RefStream> {
        self.bump(|s| s.streams += 1);
        Ok(RefStream {
            state: RefCell::new(CaptureState::Idle),
            global_captures: Rc::clone(&self.global_captures),
        })
    }

    fn alloc_device(&self, bytes: usize) -> GraphResult<RefDeviceBuffer> {
        self.check_alloc_allowed("device allocation")?;
        Ok(RefDeviceBuffer(Rc::new(RefCell::new(vec![0; bytes]))))
    }

    fn alloc_host(&self, bytes: usize) -> GraphResult<RefHostBuffer> {
        self.check_alloc_allowed("page-locked host allocation")?;
        Ok(RefHostBuffer(Rc::new(RefCell::new(vec![0; bytes]))))
    }

    fn write_host(&self, dst: &mut RefHostBuffer, src: &[u8]) -> GraphResult<()> {
        let mut mem = dst.0.borrow_mut();
        if src.len() > mem.len() {
            return Err(GraphError::BufferTooSmall {
                what: "host staging write",
                needed: src.len(),
                capacity: mem.len(),
            });
        }
        mem[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read_host(&self, src: &RefHostBuffer, dst: &mut [u8]) -> GraphResult<()> {
        let mem = src.0.borrow();
        if dst.len() > mem.len() {
            return Err(GraphError::BufferTooSmall {
                what: "host staging read",
                needed: dst.len(),
                capacity: mem.len(),
            });
        }
        dst.copy_from_slice(&mem[..dst.len()]);
        Ok(())
    }

    fn begin_capture(&self, stream: &RefStream, mode: CaptureMode) -> GraphResult<()> {
        let mut state = stream.state.borrow_mut();
        if !matches!(*state, CaptureState::Idle) {
            return Err(GraphError::capture("stream is already capturing"));
        }
        *state = CaptureState::Capturing {
            mode,
            ops: Vec::new(),
        };
        if mode == CaptureMode::Global {
            self.global_captures.set(self.global_captures.get() + 1);
        }
        self.bump(|s| s.captures += 1);
        Ok(())
    }

    fn end_capture(&self, stream: &RefStream) -> GraphResult<RefGraph> {
        let previous = std::mem::replace(&mut *stream.state.borrow_mut(), CaptureState::Idle);
        match previous {
            CaptureState::Capturing { mode, ops } => {
                if mode == CaptureMode::Global {
                    stream.release_global();
                }
                Ok(RefGraph { ops })
            }
            CaptureState::Invalidated => {
                Err(GraphError::capture("capture was invalidated by a prohibited call"))
            }
            CaptureState::Idle => Err(GraphError::capture("stream is not capturing")),
        }
    }

    fn memcpy_htod_async(
        &self,
        dst: &RefDeviceBuffer,
        src: &RefHostBuffer,
        bytes: usize,
        stream: &RefStream,
    ) -> GraphResult<()> {
        let op = Self::copy_op(&dst.0, &src.0, bytes, "host-to-device copy")?;
        self.submit(stream, StreamOp::Memcpy(op))
    }

    fn memcpy_dtoh_async(
        &self,
        dst: &RefHostBuffer,
        src: &RefDeviceBuffer,
        bytes: usize,
        stream: &RefStream,
    ) -> GraphResult<()> {
        let op = Self::copy_op(&dst.0, &src.0, bytes, "device-to-host copy")?;
        self.submit(stream, StreamOp::Memcpy(op))
    }

    fn instantiate(&self, graph: &RefGraph) -> GraphResult<RefGraphExec> {
        self.bump(|s| s.instantiations += 1);
        Ok(RefGraphExec {
            ops: graph.ops.clone(),
        })
    }

    fn launch(&self, exec: &RefGraphExec, stream: &RefStream) -> GraphResult<()> {
        if !matches!(*stream.state.borrow(), CaptureState::Idle) {
            return Err(GraphError::capture(
                "graph launch into a capturing stream is not supported",
            ));
        }
        exec.ops.iter().for_each(StreamOp::run);
        self.bump(|s| s.launches += 1);
        Ok(())
    }

    fn synchronize(&self, stream: &RefStream) -> GraphResult<()> {
        let mut state = stream.state.borrow_mut();
        let mode = match &*state {
            CaptureState::Idle => {
                self.bump(|s| s.synchronizations += 1);
                return Ok(());
            }
            CaptureState::Capturing { mode, .. } => *mode,
            CaptureState::Invalidated => {
                return Err(GraphError::capture(
                    "stream capture was invalidated; end the capture first",
                ))
            }
        };
        if mode == CaptureMode::Global {
            stream.release_global();
        }
        *state = CaptureState::Invalidated;
        Err(GraphError::capture(
            "synchronizing a capturing stream is prohibited; capture invalidated",
        ))
    }

    fn deserialize_engine(&self, blob: &[u8]) -> GraphResult<Option<Rc<RefEngine>>> {
        let Some(body) = blob.strip_prefix(&PLAN_MAGIC[..]) else {
            tracing::error!(bytes = blob.len(), "engine blob is missing the reference plan magic");
            return Ok(None);
        };
        let plan: EnginePlan = match serde_json::from_slice(body) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(error = %e, "engine blob is not a readable reference plan");
                return Ok(None);
            }
        };
        match Self::engine_from_plan(plan) {
            Ok(engine) => {
                self.bump(|s| s.engines_deserialized += 1);
                Ok(Some(Rc::new(engine)))
            }
            Err(reason) => {
                tracing::error!(%reason, "reference plan describes an invalid network");
                Ok(None)
            }
        }
    }

    fn build_serialized_network(
        &self,
        network: &NetworkDefinition,
        config: &BuilderConfig,
    ) -> GraphResult<Option<Vec<u8>>> {
        if let Err(reason) = network.validate(config) {
            tracing::error!(%reason, "network rejected by reference builder");
            return Ok(None);
        }
        let plan = EnginePlan {
            network: network.clone(),
            builder: config.clone(),
        };
        let body = serde_json::to_vec(&plan)
            .map_err(|e| GraphError::EngineBuild { reason: e.to_string() })?;
        let mut blob = Vec::with_capacity(PLAN_MAGIC.len() + body.len());
        blob.extend_from_slice(&PLAN_MAGIC);
        blob.extend_from_slice(&body);
        self.bump(|s| s.engines_built += 1);
        Ok(Some(blob))
    }

    fn io_tensors(&self, engine: &Rc<RefEngine>) -> GraphResult<Vec<IoTensor>> {
        Ok(engine.io.clone())
    }

    fn create_execution_context(&self, engine: &Rc<RefEngine>) -> GraphResult<RefContext> {
        Ok(RefContext {
            engine: Rc::clone(engine),
            shapes: HashMap::new(),
            addresses: HashMap::new(),
        })
    }

    fn set_input_shape(&self, context: &mut RefContext, name: &str, shape: &Shape) -> GraphResult<()> {
        let network = &context.engine.plan.network;
        let decl = network
            .input(name)
            .ok_or_else(|| GraphError::UnknownTensor(name.to_string()))?;
        if decl.dims.rank() != shape.rank() {
            return Err(GraphError::RankMismatch {
                tensor: name.to_string(),
                expected: decl.dims.rank(),
                actual: shape.rank(),
            });
        }
        if let Some(profile) = context.engine.plan.builder.profile_for(name) {
            profile.check(shape)?;
        }
        if !decl.dims.admits(shape) {
            let declared = Shape::from_i64(&decl.dims.0).unwrap_or_else(|| shape.clone());
            return Err(GraphError::ShapeOutOfProfile {
                tensor: name.to_string(),
                shape: shape.clone(),
                min: declared.clone(),
                max: declared,
            });
        }
        context.shapes.insert(name.to_string(), shape.clone());
        Ok(())
    }

    fn tensor_shape(&self, context: &RefContext, name: &str) -> GraphResult<Shape> {
        let network = &context.engine.plan.network;
        let sources = network.sources();
        let root = sources
            .get(name)
            .ok_or_else(|| GraphError::UnknownTensor(name.to_string()))?;
        context.shapes.get(*root).cloned().ok_or_else(|| {
            GraphError::tensorrt(
                "getTensorShape",
                format!("input '{root}' has no shape bound; '{name}' is unresolved"),
            )
        })
    }

    fn set_tensor_address(
        &self,
        context: &mut RefContext,
        name: &str,
        buffer: &RefDeviceBuffer,
    ) -> GraphResult<()> {
        if !context.engine.io.iter().any(|t| t.name == name) {
            return Err(GraphError::UnknownTensor(name.to_string()));
        }
        context
            .addresses
            .insert(name.to_string(), Rc::clone(&buffer.0));
        Ok(())
    }

    fn enqueue(&self, context: &mut RefContext, stream: &RefStream) -> GraphResult<()> {
        let engine = Rc::clone(&context.engine);
        let network = &engine.plan.network;
        let sources = network.sources();
        let mut copies = Vec::with_capacity(network.outputs.len());
        for output in &network.outputs {
            let root = sources
                .get(output.as_str())
                .ok_or_else(|| GraphError::UnknownTensor(output.clone()))?;
            let decl = network
                .input(root)
                .ok_or_else(|| GraphError::UnknownTensor(root.to_string()))?;
            let shape = self.tensor_shape(context, output)?;
            let bytes = shape.volume() * decl.dtype.size();
            copies.push(Self::copy_op(
                bound_address(context, output)?,
                bound_address(context, root)?,
                bytes,
                "inference binding",
            )?);
        }
        self.submit(stream, StreamOp::Kernel(copies))
    }
}

fn bound_address<'a>(context: &'a RefContext, name: &str) -> GraphResult<&'a Memory> {
    context.addresses.get(name).ok_or_else(|| {
        GraphError::tensorrt("enqueueV3", format!("tensor '{name}' has no address"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::demo_engine;

    #[test]
    fn eager_copies_outside_capture() {
        let backend = ReferenceBackend::new();
        let stream = backend.create_stream().unwrap();
        let device = backend.alloc_device(4).unwrap();
        let mut host_in = backend.alloc_host(4).unwrap();
        let host_out = backend.alloc_host(4).unwrap();

        backend.write_host(&mut host_in, &[1, 2, 3, 4]).unwrap();
        backend.memcpy_htod_async(&device, &host_in, 4, &stream).unwrap();
        backend.memcpy_dtoh_async(&host_out, &device, 4, &stream).unwrap();
        backend.synchronize(&stream).unwrap();

        let mut out = [0u8; 4];
        backend.read_host(&host_out, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn captured_work_runs_only_on_launch() {
        let backend = ReferenceBackend::new();
        let stream = backend.create_stream().unwrap();
        let device = backend.alloc_device(2).unwrap();
        let mut host_in = backend.alloc_host(2).unwrap();
        let host_out = backend.alloc_host(2).unwrap();
        backend.write_host(&mut host_in, &[7, 9]).unwrap();

        backend.begin_capture(&stream, CaptureMode::Global).unwrap();
        backend.memcpy_htod_async(&device, &host_in, 2, &stream).unwrap();
        backend.memcpy_dtoh_async(&host_out, &device, 2, &stream).unwrap();
        let graph = backend.end_capture(&stream).unwrap();
        assert_eq!(graph.node_count(), 2);

        let mut out = [0u8; 2];
        backend.read_host(&host_out, &mut out).unwrap();
        assert_eq!(out, [0, 0], "capture must not execute work");

        let exec = backend.instantiate(&graph).unwrap();
        backend.launch(&exec, &stream).unwrap();
        backend.synchronize(&stream).unwrap();
        backend.read_host(&host_out, &mut out).unwrap();
        assert_eq!(out, [7, 9]);
    }

    #[test]
    fn sync_inside_capture_invalidates() {
        let backend = ReferenceBackend::new();
        let stream = backend.create_stream().unwrap();
        backend.begin_capture(&stream, CaptureMode::Global).unwrap();

        assert!(matches!(backend.synchronize(&stream), Err(GraphError::Capture(_))));
        assert!(matches!(backend.end_capture(&stream), Err(GraphError::Capture(_))));

        // The stream is usable again after the failed capture ends.
        backend.begin_capture(&stream, CaptureMode::Global).unwrap();
        assert!(backend.end_capture(&stream).is_ok());
    }

    #[test]
    fn capture_state_errors() {
        let backend = ReferenceBackend::new();
        let stream = backend.create_stream().unwrap();
        assert!(backend.end_capture(&stream).is_err());
        backend.begin_capture(&stream, CaptureMode::ThreadLocal).unwrap();
        assert!(backend.begin_capture(&stream, CaptureMode::ThreadLocal).is_err());
    }

    #[test]
    fn allocation_forbidden_during_global_capture() {
        let backend = ReferenceBackend::new();
        let stream = backend.create_stream().unwrap();
        backend.begin_capture(&stream, CaptureMode::Global).unwrap();
        assert!(backend.alloc_device(16).is_err());
        backend.end_capture(&stream).unwrap();
        assert!(backend.alloc_device(16).is_ok());

        backend.begin_capture(&stream, CaptureMode::Relaxed).unwrap();
        assert!(backend.alloc_host(16).is_ok());
        backend.end_capture(&stream).unwrap();
    }

    #[test]
    fn dropping_a_capturing_stream_ends_global_capture() {
        let backend = ReferenceBackend::new();
        let stream = backend.create_stream().unwrap();
        backend.begin_capture(&stream, CaptureMode::Global).unwrap();
        assert!(backend.alloc_device(16).is_err());
        drop(stream);
        assert!(backend.alloc_device(16).is_ok());

        let invalidated = backend.create_stream().unwrap();
        backend.begin_capture(&invalidated, CaptureMode::Global).unwrap();
        assert!(backend.synchronize(&invalidated).is_err());
        drop(invalidated);
        assert!(backend.alloc_host(16).is_ok());
    }

    #[test]
    fn garbage_blob_yields_no_engine() {
        let backend = ReferenceBackend::new();
        assert!(backend.deserialize_engine(b"not an engine").unwrap().is_none());
        let mut truncated = PLAN_MAGIC.to_vec();
        truncated.extend_from_slice(b"{\"network\":");
        assert!(backend.deserialize_engine(&truncated).unwrap().is_none());
    }

    #[test]
    fn engine_io_table() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let io = backend.io_tensors(&engine).unwrap();
        assert_eq!(io.len(), 2);
        assert_eq!(io[0].name, "inputT0");
        assert_eq!(io[0].mode, TensorIoMode::Input);
        assert_eq!(io[1].name, "outputT0");
        assert_eq!(io[1].mode, TensorIoMode::Output);
    }

    #[test]
    fn context_resolves_output_shape() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();

        assert!(backend.tensor_shape(&context, "outputT0").is_err());
        backend
            .set_input_shape(&mut context, "inputT0", &Shape::new([2, 3, 4]))
            .unwrap();
        assert_eq!(
            backend.tensor_shape(&context, "outputT0").unwrap(),
            Shape::new([2, 3, 4])
        );
        assert!(matches!(
            backend.set_input_shape(&mut context, "inputT0", &Shape::new([7, 8, 10])),
            Err(GraphError::ShapeOutOfProfile { .. })
        ));
        assert!(matches!(
            backend.set_input_shape(&mut context, "nope", &Shape::new([1, 1, 1])),
            Err(GraphError::UnknownTensor(_))
        ));
    }

    #[test]
    fn enqueue_requires_addresses() {
        let backend = ReferenceBackend::new();
        let engine = demo_engine(&backend);
        let mut context = backend.create_execution_context(&engine).unwrap();
        let stream = backend.create_stream().unwrap();
        backend
            .set_input_shape(&mut context, "inputT0", &Shape::new([1, 1, 1]))
            .unwrap();
        assert!(matches!(
            backend.enqueue(&mut context, &stream),
            Err(GraphError::TensorRt { .. })
        ));
    }
}
