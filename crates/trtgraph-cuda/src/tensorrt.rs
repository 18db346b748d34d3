#[cfg(feature = "tensorrt")]
mod inner {
    use std::ffi::{c_char, c_void, CStr, CString};
    use std::ptr::NonNull;
    use std::sync::Arc;

    use trtgraph_core::{
        Backend, BuilderConfig, CaptureMode, DataType, GraphError, GraphResult, IoTensor, Layer,
        LogSeverity, NetworkDefinition, Shape, TensorIoMode,
    };

    use crate::driver::{CudaDriver, CudaGraph, CudaGraphExec, CudaStream, DeviceBuffer, PinnedBuffer};

    // -----------------------------------------------------------------------
    // C++ TRT shim FFI (compiled from cpp/trt_shim.cpp)
    // -----------------------------------------------------------------------

    type LogFn = extern "C" fn(severity: i32, msg: *const c_char);

    extern "C" {
        fn trt_set_log_callback(callback: LogFn, max_severity: i32);
        fn trt_get_version() -> i32;

        fn trt_network_create() -> *mut c_void;
        fn trt_network_destroy(handle: *mut c_void);
        fn trt_network_add_input(
            handle: *mut c_void,
            name: *const c_char,
            dtype: i32,
            nb_dims: i32,
            dims: *const i64,
        ) -> i32;
        fn trt_network_add_identity(
            handle: *mut c_void,
            input: *const c_char,
            output: *const c_char,
        ) -> i32;
        fn trt_network_mark_output(handle: *mut c_void, name: *const c_char) -> i32;
        fn trt_network_set_profile(
            handle: *mut c_void,
            name: *const c_char,
            nb_dims: i32,
            min: *const i64,
            opt: *const i64,
            max: *const i64,
        ) -> i32;
        fn trt_network_build(
            handle: *mut c_void,
            workspace_bytes: usize,
            out_data: *mut *mut c_void,
            out_len: *mut usize,
        ) -> i32;
        fn trt_free_buffer(data: *mut c_void);

        fn trt_deserialize_engine(data: *const c_void, len: usize) -> *mut c_void;
        fn trt_destroy_engine(handle: *mut c_void);
        fn trt_engine_nb_io_tensors(handle: *mut c_void) -> i32;
        fn trt_engine_io_tensor_name(handle: *mut c_void, index: i32) -> *const c_char;
        fn trt_engine_io_mode(handle: *mut c_void, name: *const c_char) -> i32;
        fn trt_engine_tensor_dtype(handle: *mut c_void, name: *const c_char) -> i32;

        fn trt_create_context(engine: *mut c_void) -> *mut c_void;
        fn trt_destroy_context(context: *mut c_void);
        fn trt_set_input_shape(
            context: *mut c_void,
            name: *const c_char,
            nb_dims: i32,
            dims: *const i64,
        ) -> i32;
        fn trt_get_tensor_shape(
            context: *mut c_void,
            name: *const c_char,
            dims: *mut i64,
            capacity: i32,
        ) -> i32;
        fn trt_set_tensor_address(context: *mut c_void, name: *const c_char, ptr: *mut c_void)
            -> i32;
        fn trt_enqueue_v3(context: *mut c_void, stream: *mut c_void) -> i32;
    }

    /// `nvinfer1::Dims::MAX_DIMS`.
    const MAX_DIMS: usize = 8;

    pub(crate) fn trt_error_message(rc: i32) -> &'static str {
        match rc {
            -1 => "TensorRT rejected the call",
            -2 => "dimension count out of range",
            -3 => "unknown tensor name",
            -5 => "failed to create optimization profile",
            -6 => "failed to set optimization profile dimensions",
            -8 => "failed to add optimization profile to config",
            -9 => "engine serialization failed",
            -10 => "out of host memory copying the plan",
            _ => "unknown error",
        }
    }

    /// Forward TensorRT's logger into `tracing` under target `tensorrt`.
    extern "C" fn forward_log(severity: i32, msg: *const c_char) {
        if msg.is_null() {
            return;
        }
        // SAFETY: TensorRT passes a NUL-terminated message valid for this call.
        let msg = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
        match severity {
            0 | 1 => tracing::error!(target: "tensorrt", "{msg}"),
            2 => tracing::warn!(target: "tensorrt", "{msg}"),
            3 => tracing::info!(target: "tensorrt", "{msg}"),
            _ => tracing::debug!(target: "tensorrt", "{msg}"),
        }
    }

    fn c_name(name: &str) -> GraphResult<CString> {
        CString::new(name).map_err(|_| GraphError::UnknownTensor(name.to_string()))
    }

    fn shim_check(rc: i32, op: &'static str) -> GraphResult<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(GraphError::tensorrt(
                op,
                format!("{} (rc={rc})", trt_error_message(rc)),
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Owned shim handles
    // -----------------------------------------------------------------------

    struct NetworkHandle(NonNull<c_void>);

    impl Drop for NetworkHandle {
        fn drop(&mut self) {
            // SAFETY: Created by trt_network_create and destroyed once.
            unsafe { trt_network_destroy(self.0.as_ptr()) }
        }
    }

    struct EngineHandle(NonNull<c_void>);

    impl Drop for EngineHandle {
        fn drop(&mut self) {
            // SAFETY: Created by trt_deserialize_engine; every context holds
            // an Arc to this handle, so none outlives it.
            unsafe { trt_destroy_engine(self.0.as_ptr()) }
        }
    }

    /// Deserialized engine. Cloning shares the same native engine.
    #[derive(Clone)]
    pub struct TrtEngine(Arc<EngineHandle>);

    impl TrtEngine {
        fn raw(&self) -> *mut c_void {
            self.0 .0.as_ptr()
        }
    }

    pub struct TrtContext {
        raw: NonNull<c_void>,
        _engine: Arc<EngineHandle>,
    }

    impl Drop for TrtContext {
        fn drop(&mut self) {
            // SAFETY: Created by trt_create_context; runs before `_engine` drops.
            unsafe { trt_destroy_context(self.raw.as_ptr()) }
        }
    }

    // -----------------------------------------------------------------------
    // TrtBackend
    // -----------------------------------------------------------------------

    /// TensorRT on a CUDA device: driver-API streams, memory and graphs, with
    /// engines built and executed through the shim.
    pub struct TrtBackend {
        driver: Arc<CudaDriver>,
    }

    impl TrtBackend {
        /// TensorRT messages less severe than `log_severity` are dropped.
        pub fn new(driver: Arc<CudaDriver>, log_severity: LogSeverity) -> Self {
            // SAFETY: `forward_log` is a plain function valid for the process.
            unsafe { trt_set_log_callback(forward_log, log_severity as i32) };
            tracing::info!(version = tensorrt_version(), "TensorRT backend ready");
            Self { driver }
        }

        pub fn driver(&self) -> &Arc<CudaDriver> {
            &self.driver
        }

        fn define(&self, network: &NetworkDefinition, config: &BuilderConfig) -> GraphResult<NetworkHandle> {
            // SAFETY: Plain constructor; null on failure.
            let handle = NonNull::new(unsafe { trt_network_create() })
                .map(NetworkHandle)
                .ok_or_else(|| GraphError::EngineBuild {
                    reason: "failed to create builder or network definition".into(),
                })?;
            let h = handle.0.as_ptr();

            for input in &network.inputs {
                let name = c_name(&input.name)?;
                // SAFETY: Handle is live; dims slice outlives the call.
                let rc = unsafe {
                    trt_network_add_input(
                        h,
                        name.as_ptr(),
                        input.dtype.code(),
                        input.dims.rank() as i32,
                        input.dims.0.as_ptr(),
                    )
                };
                shim_check(rc, "addInput")?;
            }
            for layer in &network.layers {
                match layer {
                    Layer::Identity { input, output } => {
                        let (input, output) = (c_name(input)?, c_name(output)?);
                        // SAFETY: Handle is live; names outlive the call.
                        let rc = unsafe {
                            trt_network_add_identity(h, input.as_ptr(), output.as_ptr())
                        };
                        shim_check(rc, "addIdentity")?;
                    }
                }
            }
            for output in &network.outputs {
                let name = c_name(output)?;
                // SAFETY: Handle is live; name outlives the call.
                shim_check(unsafe { trt_network_mark_output(h, name.as_ptr()) }, "markOutput")?;
            }
            for profile in &config.profiles {
                let name = c_name(&profile.input)?;
                let (min, opt, max) = (
                    profile.min.to_i64(),
                    profile.opt.to_i64(),
                    profile.max.to_i64(),
                );
                // SAFETY: Handle is live; all three arrays hold `rank` values.
                let rc = unsafe {
                    trt_network_set_profile(
                        h,
                        name.as_ptr(),
                        min.len() as i32,
                        min.as_ptr(),
                        opt.as_ptr(),
                        max.as_ptr(),
                    )
                };
                shim_check(rc, "setDimensions")?;
            }
            Ok(handle)
        }
    }

    pub fn tensorrt_version() -> i32 {
        // SAFETY: Reads compile-time constants.
        unsafe { trt_get_version() }
    }

    impl Backend for TrtBackend {
        type Stream = CudaStream;
        type DeviceBuffer = DeviceBuffer;
        type HostBuffer = PinnedBuffer;
        type Graph = CudaGraph;
        type GraphExec = CudaGraphExec;
        type Engine = TrtEngine;
        type Context = TrtContext;

        fn name(&self) -> &'static str {
            "tensorrt"
        }

        fn create_stream(&self) -> GraphResult<CudaStream> {
            self.driver.create_stream()
        }

        fn alloc_device(&self, bytes: usize) -> GraphResult<DeviceBuffer> {
            self.driver.alloc(bytes)
        }

        fn alloc_host(&self, bytes: usize) -> GraphResult<PinnedBuffer> {
            self.driver.alloc_pinned(bytes)
        }

        fn write_host(&self, dst: &mut PinnedBuffer, src: &[u8]) -> GraphResult<()> {
            if src.len() > dst.bytes() {
                return Err(GraphError::BufferTooSmall {
                    what: "host staging write",
                    needed: src.len(),
                    capacity: dst.bytes(),
                });
            }
            dst.as_mut_slice()[..src.len()].copy_from_slice(src);
            Ok(())
        }

        fn read_host(&self, src: &PinnedBuffer, dst: &mut [u8]) -> GraphResult<()> {
            if dst.len() > src.bytes() {
                return Err(GraphError::BufferTooSmall {
                    what: "host staging read",
                    needed: dst.len(),
                    capacity: src.bytes(),
                });
            }
            dst.copy_from_slice(&src.as_slice()[..dst.len()]);
            Ok(())
        }

        fn begin_capture(&self, stream: &CudaStream, mode: CaptureMode) -> GraphResult<()> {
            self.driver.begin_capture(stream, mode)
        }

        fn end_capture(&self, stream: &CudaStream) -> GraphResult<CudaGraph> {
            self.driver.end_capture(stream)
        }

        fn memcpy_htod_async(
            &self,
            dst: &DeviceBuffer,
            src: &PinnedBuffer,
            bytes: usize,
            stream: &CudaStream,
        ) -> GraphResult<()> {
            self.driver.memcpy_htod_async(dst, src, bytes, stream)
        }

        fn memcpy_dtoh_async(
            &self,
            dst: &PinnedBuffer,
            src: &DeviceBuffer,
            bytes: usize,
            stream: &CudaStream,
        ) -> GraphResult<()> {
            self.driver.memcpy_dtoh_async(dst, src, bytes, stream)
        }

        fn instantiate(&self, graph: &CudaGraph) -> GraphResult<CudaGraphExec> {
            self.driver.instantiate(graph)
        }

        fn launch(&self, exec: &CudaGraphExec, stream: &CudaStream) -> GraphResult<()> {
            self.driver.launch(exec, stream)
        }

        fn synchronize(&self, stream: &CudaStream) -> GraphResult<()> {
            self.driver.synchronize(stream)
        }

        fn deserialize_engine(&self, blob: &[u8]) -> GraphResult<Option<TrtEngine>> {
            self.driver.ensure_current()?;
            // SAFETY: Blob pointer and length describe a live slice.
            let raw = unsafe { trt_deserialize_engine(blob.as_ptr() as *const c_void, blob.len()) };
            Ok(NonNull::new(raw).map(|raw| TrtEngine(Arc::new(EngineHandle(raw)))))
        }

        fn build_serialized_network(
            &self,
            network: &NetworkDefinition,
            config: &BuilderConfig,
        ) -> GraphResult<Option<Vec<u8>>> {
            if let Err(reason) = network.validate(config) {
                tracing::error!(%reason, "network rejected before build");
                return Ok(None);
            }
            self.driver.ensure_current()?;
            let handle = self.define(network, config).map_err(|err| match err {
                GraphError::TensorRt { op, message } => GraphError::EngineBuild {
                    reason: format!("{op}: {message}"),
                },
                other => other,
            })?;

            let mut out_data: *mut c_void = std::ptr::null_mut();
            let mut out_len: usize = 0;
            // SAFETY: Handle is live; out pointers are valid locals.
            let rc = unsafe {
                trt_network_build(
                    handle.0.as_ptr(),
                    config.workspace_bytes,
                    &mut out_data,
                    &mut out_len,
                )
            };
            if rc != 0 || out_data.is_null() {
                tracing::error!(rc, "TRT engine build failed: {}", trt_error_message(rc));
                return Ok(None);
            }
            // SAFETY: Shim malloc'd `out_len` bytes at `out_data`.
            let plan =
                unsafe { std::slice::from_raw_parts(out_data as *const u8, out_len) }.to_vec();
            // SAFETY: Freed exactly once, after copying.
            unsafe { trt_free_buffer(out_data) };
            Ok(Some(plan))
        }

        fn io_tensors(&self, engine: &TrtEngine) -> GraphResult<Vec<IoTensor>> {
            let raw = engine.raw();
            // SAFETY: Engine handle is live for the borrow.
            let count = unsafe { trt_engine_nb_io_tensors(raw) };
            let mut tensors = Vec::with_capacity(count.max(0) as usize);
            for index in 0..count {
                // SAFETY: Index is in range; the name is owned by the engine.
                let ptr = unsafe { trt_engine_io_tensor_name(raw, index) };
                if ptr.is_null() {
                    return Err(GraphError::tensorrt("getIOTensorName", format!("no name at index {index}")));
                }
                // SAFETY: Non-null NUL-terminated string owned by the engine.
                let cname = unsafe { CStr::from_ptr(ptr) };
                let name = cname.to_string_lossy().into_owned();
                // SAFETY: Name pointer is valid as above.
                let (mode, dtype) = unsafe {
                    (
                        trt_engine_io_mode(raw, cname.as_ptr()),
                        trt_engine_tensor_dtype(raw, cname.as_ptr()),
                    )
                };
                let mode = match mode {
                    1 => TensorIoMode::Input,
                    2 => TensorIoMode::Output,
                    other => {
                        return Err(GraphError::tensorrt(
                            "getTensorIOMode",
                            format!("tensor '{name}' has IO mode {other}"),
                        ))
                    }
                };
                let dtype = DataType::from_code(dtype).ok_or_else(|| {
                    GraphError::tensorrt(
                        "getTensorDataType",
                        format!("tensor '{name}' has unknown data type {dtype}"),
                    )
                })?;
                tensors.push(IoTensor { name, mode, dtype });
            }
            Ok(tensors)
        }

        fn create_execution_context(&self, engine: &TrtEngine) -> GraphResult<TrtContext> {
            // SAFETY: Engine handle is live; the context keeps it alive after.
            let raw = unsafe { trt_create_context(engine.raw()) };
            let raw = NonNull::new(raw).ok_or_else(|| {
                GraphError::tensorrt("createExecutionContext", "returned null")
            })?;
            Ok(TrtContext {
                raw,
                _engine: Arc::clone(&engine.0),
            })
        }

        fn set_input_shape(
            &self,
            context: &mut TrtContext,
            name: &str,
            shape: &Shape,
        ) -> GraphResult<()> {
            let cname = c_name(name)?;
            let dims = shape.to_i64();
            // SAFETY: Context is live; dims outlive the call.
            let rc = unsafe {
                trt_set_input_shape(
                    context.raw.as_ptr(),
                    cname.as_ptr(),
                    dims.len() as i32,
                    dims.as_ptr(),
                )
            };
            if rc != 0 {
                return Err(GraphError::tensorrt(
                    "setInputShape",
                    format!("shape {shape} rejected for '{name}'"),
                ));
            }
            Ok(())
        }

        fn tensor_shape(&self, context: &TrtContext, name: &str) -> GraphResult<Shape> {
            let cname = c_name(name)?;
            let mut dims = [0i64; MAX_DIMS];
            // SAFETY: Context is live; `dims` holds MAX_DIMS values.
            let rank = unsafe {
                trt_get_tensor_shape(
                    context.raw.as_ptr(),
                    cname.as_ptr(),
                    dims.as_mut_ptr(),
                    MAX_DIMS as i32,
                )
            };
            if rank < 0 {
                return Err(GraphError::UnknownTensor(name.to_string()));
            }
            let rank = (rank as usize).min(MAX_DIMS);
            Shape::from_i64(&dims[..rank]).ok_or_else(|| {
                GraphError::tensorrt(
                    "getTensorShape",
                    format!("shape of '{name}' is unresolved: {:?}", &dims[..rank]),
                )
            })
        }

        fn set_tensor_address(
            &self,
            context: &mut TrtContext,
            name: &str,
            buffer: &DeviceBuffer,
        ) -> GraphResult<()> {
            let cname = c_name(name)?;
            // SAFETY: Context is live; the device pointer stays valid while
            // the executor owns `buffer`.
            let rc = unsafe {
                trt_set_tensor_address(
                    context.raw.as_ptr(),
                    cname.as_ptr(),
                    buffer.device_ptr() as *mut c_void,
                )
            };
            if rc != 0 {
                return Err(GraphError::UnknownTensor(name.to_string()));
            }
            Ok(())
        }

        fn enqueue(&self, context: &mut TrtContext, stream: &CudaStream) -> GraphResult<()> {
            // SAFETY: Context and stream are live for the call.
            let rc = unsafe { trt_enqueue_v3(context.raw.as_ptr(), stream.raw()) };
            shim_check(rc, "enqueueV3")
        }
    }

}

#[cfg(feature = "tensorrt")]
pub use inner::*;
