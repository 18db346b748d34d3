//! CUDA driver API, resolved from `libcuda` at runtime.
//!
//! `CudaDriver` is an explicit handle: it initialises the driver, retains
//! the device's primary context (the one the CUDA runtime, and therefore
//! TensorRT, also uses) and makes it current. Every resource below holds an
//! `Arc<CudaDriver>`, so the context outlives all allocations and is
//! released when the last handle drops.

use std::ffi::{c_char, c_void, CStr};
use std::fmt;
use std::sync::Arc;

use libloading::Library;
use trtgraph_core::{CaptureMode, GraphError, GraphResult};

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUstream = *mut c_void;
type CUgraph = *mut c_void;
type CUgraphExec = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDriverGetVersionFn = unsafe extern "C" fn(version: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetNameFn =
    unsafe extern "C" fn(name: *mut c_char, len: i32, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxRetainFn =
    unsafe extern "C" fn(ctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxReleaseFn = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuGetErrorNameFn = unsafe extern "C" fn(error: CUresult, name: *mut *const c_char) -> CUresult;

type CuMemAllocFn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemAllocHostFn = unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type CuMemcpyHtoDAsyncFn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHAsyncFn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;

type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamBeginCaptureFn = unsafe extern "C" fn(stream: CUstream, mode: u32) -> CUresult;
type CuStreamEndCaptureFn = unsafe extern "C" fn(stream: CUstream, graph: *mut CUgraph) -> CUresult;

type CuGraphInstantiateWithFlagsFn =
    unsafe extern "C" fn(exec: *mut CUgraphExec, graph: CUgraph, flags: u64) -> CUresult;
type CuGraphLaunchFn = unsafe extern "C" fn(exec: CUgraphExec, stream: CUstream) -> CUresult;
type CuGraphDestroyFn = unsafe extern "C" fn(graph: CUgraph) -> CUresult;
type CuGraphExecDestroyFn = unsafe extern "C" fn(exec: CUgraphExec) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_driver_get_version: CuDriverGetVersionFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_name: CuDeviceGetNameFn,
    cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn,
    cu_device_primary_ctx_release_v2: CuDevicePrimaryCtxReleaseFn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_get_error_name: CuGetErrorNameFn,
    cu_mem_alloc_v2: CuMemAllocFn,
    cu_mem_free_v2: CuMemFreeFn,
    cu_mem_alloc_host_v2: CuMemAllocHostFn,
    cu_mem_free_host: CuMemFreeHostFn,
    cu_memcpy_hto_d_async_v2: CuMemcpyHtoDAsyncFn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyFn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_stream_begin_capture_v2: CuStreamBeginCaptureFn,
    cu_stream_end_capture: CuStreamEndCaptureFn,
    cu_graph_instantiate_with_flags: CuGraphInstantiateWithFlagsFn,
    cu_graph_launch: CuGraphLaunchFn,
    cu_graph_destroy: CuGraphDestroyFn,
    cu_graph_exec_destroy: CuGraphExecDestroyFn,
}

// ---------------------------------------------------------------------------
// CudaDriver
// ---------------------------------------------------------------------------

pub struct CudaDriver {
    fns: DriverFns,
    device: CUdevice,
    ordinal: i32,
    // Stored as usize so resources holding the driver stay Send.
    ctx: usize,
    // Dropped last: function pointers above point into this library.
    _lib: Library,
}

impl fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDriver")
            .field("ordinal", &self.ordinal)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: The primary context was retained once in `new`.
            let _ = unsafe { (self.fns.cu_device_primary_ctx_release_v2)(self.device) };
            self.ctx = 0;
        }
    }
}

impl CudaDriver {
    /// Load `libcuda`, run `cuInit`, select device `ordinal`, retain its
    /// primary context and make it current on this thread.
    pub fn new(ordinal: i32) -> GraphResult<Arc<Self>> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_driver_get_version: load_symbol(&lib, b"cuDriverGetVersion\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_name: load_symbol(&lib, b"cuDeviceGetName\0")?,
            cu_device_primary_ctx_retain: load_symbol(&lib, b"cuDevicePrimaryCtxRetain\0")?,
            cu_device_primary_ctx_release_v2: load_symbol(
                &lib,
                b"cuDevicePrimaryCtxRelease_v2\0",
            )?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_get_error_name: load_symbol(&lib, b"cuGetErrorName\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_mem_alloc_host_v2: load_symbol(&lib, b"cuMemAllocHost_v2\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
            cu_memcpy_hto_d_async_v2: load_symbol(&lib, b"cuMemcpyHtoDAsync_v2\0")?,
            cu_memcpy_dto_h_async_v2: load_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_stream_begin_capture_v2: load_symbol(&lib, b"cuStreamBeginCapture_v2\0")?,
            cu_stream_end_capture: load_symbol(&lib, b"cuStreamEndCapture\0")?,
            cu_graph_instantiate_with_flags: load_symbol(
                &lib,
                b"cuGraphInstantiateWithFlags\0",
            )?,
            cu_graph_launch: load_symbol(&lib, b"cuGraphLaunch\0")?,
            cu_graph_destroy: load_symbol(&lib, b"cuGraphDestroy\0")?,
            cu_graph_exec_destroy: load_symbol(&lib, b"cuGraphExecDestroy\0")?,
        };

        let mut driver = Self {
            fns,
            device: 0,
            ordinal,
            ctx: 0,
            _lib: lib,
        };
        // SAFETY: Out pointers are valid locals; calls follow the driver API
        // initialisation order (cuInit before any other call).
        unsafe {
            driver.check((driver.fns.cu_init)(0), "cuInit")?;
            let mut device: CUdevice = 0;
            driver.check((driver.fns.cu_device_get)(&mut device, ordinal), "cuDeviceGet")?;
            driver.device = device;
            let mut ctx: CUcontext = std::ptr::null_mut();
            driver.check(
                (driver.fns.cu_device_primary_ctx_retain)(&mut ctx, device),
                "cuDevicePrimaryCtxRetain",
            )?;
            driver.ctx = ctx as usize;
        }
        driver.ensure_current()?;

        tracing::info!(
            ordinal,
            device = %driver.device_name().unwrap_or_else(|_| "<unknown>".into()),
            driver_version = driver.version().unwrap_or(0),
            "CUDA device initialised"
        );
        Ok(Arc::new(driver))
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn version(&self) -> GraphResult<i32> {
        let mut version = 0;
        // SAFETY: `version` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_driver_get_version)(&mut version),
                "cuDriverGetVersion",
            )?;
        }
        Ok(version)
    }

    pub fn device_name(&self) -> GraphResult<String> {
        let mut buf = [0 as c_char; 256];
        // SAFETY: Buffer length is passed; the driver NUL-terminates within it.
        unsafe {
            self.check(
                (self.fns.cu_device_get_name)(buf.as_mut_ptr(), buf.len() as i32, self.device),
                "cuDeviceGetName",
            )?;
            Ok(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
        }
    }

    pub fn ensure_current(&self) -> GraphResult<()> {
        // SAFETY: Context is retained by this driver until drop.
        unsafe { self.check((self.fns.cu_ctx_set_current)(self.ctx_ptr()), "cuCtxSetCurrent") }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }

    fn check(&self, code: CUresult, op: &'static str) -> GraphResult<()> {
        if code == CUDA_SUCCESS {
            return Ok(());
        }
        let mut name: *const c_char = std::ptr::null();
        // SAFETY: cuGetErrorName writes a static string pointer or fails.
        let resolved = unsafe { (self.fns.cu_get_error_name)(code, &mut name) };
        let name = if resolved == CUDA_SUCCESS && !name.is_null() {
            // SAFETY: Pointer is a static NUL-terminated string owned by the driver.
            unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
        } else {
            "CUDA_ERROR_UNKNOWN".to_string()
        };
        Err(driver_error(op, code, name))
    }

    // -- memory ------------------------------------------------------------

    pub fn alloc(self: &Arc<Self>, bytes: usize) -> GraphResult<DeviceBuffer> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer.
        unsafe {
            self.check((self.fns.cu_mem_alloc_v2)(&mut ptr, bytes.max(1)), "cuMemAlloc_v2")?;
        }
        Ok(DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        })
    }

    pub fn alloc_pinned(self: &Arc<Self>, bytes: usize) -> GraphResult<PinnedBuffer> {
        self.ensure_current()?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_mem_alloc_host_v2)(&mut ptr, bytes.max(1)),
                "cuMemAllocHost_v2",
            )?;
        }
        Ok(PinnedBuffer {
            driver: Arc::clone(self),
            ptr: ptr as usize,
            bytes,
        })
    }

    // -- streams -----------------------------------------------------------

    pub fn create_stream(self: &Arc<Self>) -> GraphResult<CudaStream> {
        self.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer; flags 0 is the default stream kind.
        unsafe {
            self.check((self.fns.cu_stream_create)(&mut stream, 0), "cuStreamCreate")?;
        }
        Ok(CudaStream {
            driver: Arc::clone(self),
            stream: stream as usize,
        })
    }

    pub fn memcpy_htod_async(
        &self,
        dst: &DeviceBuffer,
        src: &PinnedBuffer,
        bytes: usize,
        stream: &CudaStream,
    ) -> GraphResult<()> {
        check_copy_bounds("host-to-device copy", bytes, dst.bytes.min(src.bytes))?;
        // SAFETY: Both allocations hold at least `bytes`; the pinned source
        // outlives the stream work because the executor owns both.
        unsafe {
            self.check(
                (self.fns.cu_memcpy_hto_d_async_v2)(
                    dst.ptr,
                    src.as_ptr(),
                    bytes,
                    stream.raw(),
                ),
                "cuMemcpyHtoDAsync_v2",
            )
        }
    }

    pub fn memcpy_dtoh_async(
        &self,
        dst: &PinnedBuffer,
        src: &DeviceBuffer,
        bytes: usize,
        stream: &CudaStream,
    ) -> GraphResult<()> {
        check_copy_bounds("device-to-host copy", bytes, dst.bytes.min(src.bytes))?;
        // SAFETY: Both allocations hold at least `bytes`.
        unsafe {
            self.check(
                (self.fns.cu_memcpy_dto_h_async_v2)(dst.as_ptr(), src.ptr, bytes, stream.raw()),
                "cuMemcpyDtoHAsync_v2",
            )
        }
    }

    pub fn begin_capture(&self, stream: &CudaStream, mode: CaptureMode) -> GraphResult<()> {
        // SAFETY: Stream handle is live for the borrow.
        unsafe {
            self.check(
                (self.fns.cu_stream_begin_capture_v2)(stream.raw(), mode.code()),
                "cuStreamBeginCapture_v2",
            )
        }
    }

    pub fn end_capture(self: &Arc<Self>, stream: &CudaStream) -> GraphResult<CudaGraph> {
        let mut graph: CUgraph = std::ptr::null_mut();
        // SAFETY: Stream handle is live; `graph` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_stream_end_capture)(stream.raw(), &mut graph),
                "cuStreamEndCapture",
            )?;
        }
        Ok(CudaGraph {
            driver: Arc::clone(self),
            graph: graph as usize,
        })
    }

    pub fn instantiate(self: &Arc<Self>, graph: &CudaGraph) -> GraphResult<CudaGraphExec> {
        let mut exec: CUgraphExec = std::ptr::null_mut();
        // SAFETY: Graph handle is live; `exec` is a valid out pointer.
        unsafe {
            self.check(
                (self.fns.cu_graph_instantiate_with_flags)(&mut exec, graph.raw(), 0),
                "cuGraphInstantiateWithFlags",
            )?;
        }
        Ok(CudaGraphExec {
            driver: Arc::clone(self),
            exec: exec as usize,
        })
    }

    pub fn launch(&self, exec: &CudaGraphExec, stream: &CudaStream) -> GraphResult<()> {
        // SAFETY: Both handles are live for the borrow.
        unsafe {
            self.check(
                (self.fns.cu_graph_launch)(exec.raw(), stream.raw()),
                "cuGraphLaunch",
            )
        }
    }

    pub fn synchronize(&self, stream: &CudaStream) -> GraphResult<()> {
        // SAFETY: Stream handle is live for the borrow.
        unsafe {
            self.check(
                (self.fns.cu_stream_synchronize)(stream.raw()),
                "cuStreamSynchronize",
            )
        }
    }
}

fn driver_error(op: &'static str, code: CUresult, name: String) -> GraphError {
    GraphError::Driver { op, code, name }
}

fn check_copy_bounds(what: &'static str, bytes: usize, capacity: usize) -> GraphResult<()> {
    if bytes > capacity {
        return Err(GraphError::BufferTooSmall {
            what,
            needed: bytes,
            capacity,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: Allocated by this driver and released once.
        let _ = unsafe { (self.driver.fns.cu_mem_free_v2)(self.ptr) };
    }
}

/// Page-locked host allocation. Async copies and captured graphs reference
/// its address directly, so it must not move: it never reallocates.
pub struct PinnedBuffer {
    driver: Arc<CudaDriver>,
    ptr: usize,
    bytes: usize,
}

impl PinnedBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn as_ptr(&self) -> *mut c_void {
        self.ptr as *mut c_void
    }

    /// Host view. Only sound while no stream work touching the buffer is
    /// in flight; callers synchronize first.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is a live allocation of `bytes` (at least 1) bytes.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.bytes) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As above, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.bytes) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        // SAFETY: Allocated with cuMemAllocHost and released once.
        let _ = unsafe { (self.driver.fns.cu_mem_free_host)(self.as_ptr()) };
    }
}

pub struct CudaStream {
    driver: Arc<CudaDriver>,
    stream: usize,
}

impl CudaStream {
    /// Raw `CUstream`, identical to a runtime `cudaStream_t`.
    pub fn raw(&self) -> CUstream {
        self.stream as CUstream
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        // SAFETY: Created by this driver and destroyed once.
        let _ = unsafe { (self.driver.fns.cu_stream_destroy_v2)(self.raw()) };
    }
}

pub struct CudaGraph {
    driver: Arc<CudaDriver>,
    graph: usize,
}

impl CudaGraph {
    fn raw(&self) -> CUgraph {
        self.graph as CUgraph
    }
}

impl Drop for CudaGraph {
    fn drop(&mut self) {
        if self.graph != 0 {
            // SAFETY: Produced by cuStreamEndCapture and destroyed once.
            let _ = unsafe { (self.driver.fns.cu_graph_destroy)(self.raw()) };
        }
    }
}

pub struct CudaGraphExec {
    driver: Arc<CudaDriver>,
    exec: usize,
}

impl CudaGraphExec {
    fn raw(&self) -> CUgraphExec {
        self.exec as CUgraphExec
    }
}

impl Drop for CudaGraphExec {
    fn drop(&mut self) {
        if self.exec != 0 {
            // SAFETY: Produced by cuGraphInstantiate and destroyed once.
            let _ = unsafe { (self.driver.fns.cu_graph_exec_destroy)(self.raw()) };
        }
    }
}

// ---------------------------------------------------------------------------
// Library loading
// ---------------------------------------------------------------------------

const CUDA_LIBRARY_CANDIDATES: [&str; 4] =
    ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

fn load_cuda_library() -> GraphResult<Library> {
    for candidate in CUDA_LIBRARY_CANDIDATES {
        // SAFETY: Loading runs only the library initialisers; symbols are resolved later.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            tracing::debug!(library = candidate, "loaded CUDA driver library");
            return Ok(lib);
        }
    }
    Err(GraphError::Driver {
        op: "dlopen",
        code: -1,
        name: format!(
            "failed to load CUDA driver library (tried {})",
            CUDA_LIBRARY_CANDIDATES.join(", ")
        ),
    })
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> GraphResult<T> {
    // SAFETY: Caller provides the symbol's driver API signature.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| GraphError::Driver {
        op: "dlsym",
        code: -1,
        name: format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ),
    })?;
    Ok(*sym)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_bounds() {
        assert!(check_copy_bounds("copy", 16, 16).is_ok());
        assert!(matches!(
            check_copy_bounds("copy", 17, 16),
            Err(GraphError::BufferTooSmall {
                needed: 17,
                capacity: 16,
                ..
            })
        ));
    }

    #[test]
    fn driver_errors_carry_op_and_name() {
        let err = driver_error("cuStreamBeginCapture_v2", 900, "CUDA_ERROR_STREAM_CAPTURE_UNSUPPORTED".into());
        let msg = err.to_string();
        assert!(msg.contains("cuStreamBeginCapture_v2"), "{msg}");
        assert!(msg.contains("900"), "{msg}");
    }

    #[test]
    fn capture_mode_codes_match_driver_enum() {
        assert_eq!(CaptureMode::Global.code(), 0);
        assert_eq!(CaptureMode::ThreadLocal.code(), 1);
        assert_eq!(CaptureMode::Relaxed.code(), 2);
    }

    #[test]
    fn missing_device_reports_instead_of_panicking() {
        // Either a driver is present (and device 0 initialises or fails with
        // a driver error), or loading fails cleanly.
        match CudaDriver::new(0) {
            Ok(driver) => assert_eq!(driver.ordinal(), 0),
            Err(err) => assert!(matches!(err, GraphError::Driver { .. }), "{err}"),
        }
    }
}
