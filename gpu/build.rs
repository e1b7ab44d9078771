//! Generates CUDA runtime FFI bindings when the `cuda` feature is enabled.
//! Mirrors `rdma/build.rs`: absent the feature (or the toolkit), the crate
//! falls back to `SimulatedRuntime` and this script does nothing.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "cuda")]
    {
        use std::env;
        use std::path::PathBuf;

        let header = "/usr/local/cuda/include/cuda_runtime_api.h";
        if !PathBuf::from(header).exists() {
            println!("cargo:warning=CUDA toolkit not found at {}; build will fail without falling back to SimulatedRuntime", header);
            return;
        }

        println!("cargo:rustc-link-lib=cudart");
        println!("cargo:rustc-link-search=native=/usr/local/cuda/lib64");

        let bindings = bindgen::Builder::default()
            .header_contents("wrapper.h", &format!("#include \"{}\"\n", header))
            .allowlist_function("cudaIpcOpenMemHandle")
            .allowlist_function("cudaIpcCloseMemHandle")
            .allowlist_function("cudaStreamCreate")
            .allowlist_function("cudaStreamDestroy")
            .allowlist_function("cudaStreamSynchronize")
            .allowlist_function("cudaMemcpyAsync")
            .allowlist_type("cudaIpcMemHandle_t")
            .allowlist_type("cudaStream_t")
            .allowlist_type("cudaMemcpyKind")
            .allowlist_type("cudaError_t")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .generate()
            .expect("unable to generate CUDA runtime bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("cuda_bindings.rs"))
            .expect("couldn't write bindings");
    }
}
