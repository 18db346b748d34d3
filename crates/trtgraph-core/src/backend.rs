use crate::error::GraphResult;
use crate::network::{BuilderConfig, IoTensor, NetworkDefinition};
use crate::shape::Shape;

// ---------------------------------------------------------------------------
// CaptureMode
// ---------------------------------------------------------------------------

/// Which threads' unsafe API calls a capture guards against, numbered as
/// `CUstreamCaptureMode`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Every thread's potentially unsafe calls are prohibited while any
    /// global capture is in progress.
    #[default]
    Global,
    ThreadLocal,
    Relaxed,
}

impl CaptureMode {
    pub fn code(self) -> u32 {
        match self {
            CaptureMode::Global => 0,
            CaptureMode::ThreadLocal => 1,
            CaptureMode::Relaxed => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Clean boundary between orchestration and the vendor libraries.
///
/// The executor and the engine lifecycle only talk to this trait: they don't
/// know whether device memory lives on a GPU or in host vectors. Every
/// resource is an owned handle released on drop, so an early `?` return
/// never leaks a stream or allocation.
///
/// Stream operations follow CUDA's stream-capture rules: between
/// `begin_capture` and `end_capture` work is recorded instead of executed,
/// and `synchronize` on the capturing stream is an error that invalidates
/// the capture.
pub trait Backend {
    type Stream;
    type DeviceBuffer;
    type HostBuffer;
    type Graph;
    type GraphExec;
    type Engine;
    type Context;

    /// Short label for logs.
    fn name(&self) -> &'static str;

    fn create_stream(&self) -> GraphResult<Self::Stream>;
    fn alloc_device(&self, bytes: usize) -> GraphResult<Self::DeviceBuffer>;
    /// Page-locked host memory, addressable by async copies.
    fn alloc_host(&self, bytes: usize) -> GraphResult<Self::HostBuffer>;

    /// Fill the front of a host buffer. Only valid while no stream work
    /// touching the buffer is pending.
    fn write_host(&self, dst: &mut Self::HostBuffer, src: &[u8]) -> GraphResult<()>;
    /// Read the front of a host buffer into `dst`. Same validity rule.
    fn read_host(&self, src: &Self::HostBuffer, dst: &mut [u8]) -> GraphResult<()>;

    fn begin_capture(&self, stream: &Self::Stream, mode: CaptureMode) -> GraphResult<()>;
    fn end_capture(&self, stream: &Self::Stream) -> GraphResult<Self::Graph>;
    fn memcpy_htod_async(
        &self,
        dst: &Self::DeviceBuffer,
        src: &Self::HostBuffer,
        bytes: usize,
        stream: &Self::Stream,
    ) -> GraphResult<()>;
    fn memcpy_dtoh_async(
        &self,
        dst: &Self::HostBuffer,
        src: &Self::DeviceBuffer,
        bytes: usize,
        stream: &Self::Stream,
    ) -> GraphResult<()>;
    fn instantiate(&self, graph: &Self::Graph) -> GraphResult<Self::GraphExec>;
    fn launch(&self, exec: &Self::GraphExec, stream: &Self::Stream) -> GraphResult<()>;
    /// Block until all work queued on `stream` has completed.
    fn synchronize(&self, stream: &Self::Stream) -> GraphResult<()>;

    /// `Ok(None)` when the blob does not describe a usable engine.
    fn deserialize_engine(&self, blob: &[u8]) -> GraphResult<Option<Self::Engine>>;
    /// `Ok(None)` (or an empty blob) when the builder could not produce a plan.
    fn build_serialized_network(
        &self,
        network: &NetworkDefinition,
        config: &BuilderConfig,
    ) -> GraphResult<Option<Vec<u8>>>;
    fn io_tensors(&self, engine: &Self::Engine) -> GraphResult<Vec<IoTensor>>;
    fn create_execution_context(&self, engine: &Self::Engine) -> GraphResult<Self::Context>;

    /// Bind a concrete input shape; fails for shapes outside the profile.
    fn set_input_shape(
        &self,
        context: &mut Self::Context,
        name: &str,
        shape: &Shape,
    ) -> GraphResult<()>;
    /// Resolved shape of an IO tensor under the context's current bindings.
    fn tensor_shape(&self, context: &Self::Context, name: &str) -> GraphResult<Shape>;
    fn set_tensor_address(
        &self,
        context: &mut Self::Context,
        name: &str,
        buffer: &Self::DeviceBuffer,
    ) -> GraphResult<()>;
    /// Enqueue inference on `stream` using the bound shapes and addresses.
    fn enqueue(&self, context: &mut Self::Context, stream: &Self::Stream) -> GraphResult<()>;
}
