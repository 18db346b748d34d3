fn main() {
    // With the tensorrt feature: compile the C++ shim and link libnvinfer.
    // The CUDA driver itself is resolved at runtime via libloading.
    #[cfg(feature = "tensorrt")]
    build_tensorrt();
}

#[cfg(feature = "tensorrt")]
fn build_tensorrt() {
    use std::path::Path;

    println!("cargo:rerun-if-env-changed=CUDA_HOME");
    println!("cargo:rerun-if-env-changed=TENSORRT_ROOT");
    println!("cargo:rerun-if-changed=cpp/trt_shim.cpp");

    let trt_root = std::env::var("TENSORRT_ROOT").ok();

    let mut build = cc::Build::new();
    build
        .cpp(true)
        .std("c++17")
        .file("cpp/trt_shim.cpp")
        .warnings(false);
    if let Some(root) = &trt_root {
        build.include(Path::new(root).join("include"));
    }
    if let Some(inc) = find_cuda_include() {
        build.include(inc);
    }
    build.compile("trt_shim");

    if let Some(root) = &trt_root {
        println!(
            "cargo:rustc-link-search=native={}",
            Path::new(root).join("lib").display()
        );
    }
    link_cudart();
    println!("cargo:rustc-link-lib=dylib=nvinfer");
}

#[cfg(feature = "tensorrt")]
fn cuda_home() -> std::path::PathBuf {
    std::env::var("CUDA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/usr/local/cuda"))
}

#[cfg(feature = "tensorrt")]
fn find_cuda_include() -> Option<std::path::PathBuf> {
    let inc = cuda_home().join("include");
    inc.join("cuda_runtime_api.h").exists().then_some(inc)
}

#[cfg(feature = "tensorrt")]
fn link_cudart() {
    // NvInfer.h pulls in the runtime API; TensorRT itself depends on cudart.
    let home = cuda_home();
    for sub in ["lib64", "lib", "lib/x64"] {
        let dir = home.join(sub);
        if dir.is_dir() {
            println!("cargo:rustc-link-search=native={}", dir.display());
        }
    }
    println!("cargo:rustc-link-lib=dylib=cudart");
}
