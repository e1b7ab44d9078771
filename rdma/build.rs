//! Generates `libibverbs` FFI bindings via `bindgen` when the `stub-rdma`
//! feature is off.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let stub_mode = env::var("CARGO_FEATURE_STUB_RDMA").is_ok();

    if stub_mode {
        println!("cargo:warning=stub-rdma enabled, skipping libibverbs bindings");
        return;
    }

    println!("cargo:rustc-link-lib=ibverbs");

    if !PathBuf::from("/usr/include/infiniband/verbs.h").exists() {
        println!("cargo:warning=libibverbs-dev not found; build will fail without stub-rdma");
        println!("cargo:warning=install libibverbs-dev, or build with --features stub-rdma");
        return;
    }

    let bindings = bindgen::Builder::default()
        .header_contents("wrapper.h", "#include <infiniband/verbs.h>\n")
        .allowlist_type("ibv_device")
        .allowlist_type("ibv_context")
        .allowlist_type("ibv_pd")
        .allowlist_type("ibv_mr")
        .allowlist_type("ibv_cq")
        .allowlist_type("ibv_qp")
        .allowlist_type("ibv_qp_init_attr")
        .allowlist_type("ibv_qp_attr")
        .allowlist_type("ibv_send_wr")
        .allowlist_type("ibv_recv_wr")
        .allowlist_type("ibv_sge")
        .allowlist_type("ibv_wc")
        .allowlist_type("ibv_port_attr")
        .allowlist_type("ibv_device_attr")
        .allowlist_type("ibv_gid")
        .allowlist_function("ibv_get_device_list")
        .allowlist_function("ibv_free_device_list")
        .allowlist_function("ibv_get_device_name")
        .allowlist_function("ibv_open_device")
        .allowlist_function("ibv_close_device")
        .allowlist_function("ibv_query_device")
        .allowlist_function("ibv_query_port")
        .allowlist_function("ibv_query_gid")
        .allowlist_function("ibv_alloc_pd")
        .allowlist_function("ibv_dealloc_pd")
        .allowlist_function("ibv_reg_mr")
        .allowlist_function("ibv_dereg_mr")
        .allowlist_function("ibv_create_cq")
        .allowlist_function("ibv_destroy_cq")
        .allowlist_function("ibv_create_qp")
        .allowlist_function("ibv_destroy_qp")
        .allowlist_function("ibv_modify_qp")
        .allowlist_function("ibv_post_send")
        .allowlist_function("ibv_poll_cq")
        .allowlist_var("IBV_QP_.*")
        .allowlist_var("IBV_ACCESS_.*")
        .allowlist_var("IBV_WR_.*")
        .allowlist_var("IBV_WC_.*")
        .allowlist_var("IBV_SEND_.*")
        .allowlist_var("IBV_MTU_.*")
        .allowlist_type("ibv_qp_type")
        .allowlist_type("ibv_qp_state")
        .allowlist_type("ibv_wr_opcode")
        .allowlist_type("ibv_wc_status")
        .allowlist_type("ibv_mtu")
        .derive_debug(true)
        .derive_default(true)
        .derive_copy(true)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate()
        .expect("unable to generate libibverbs bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("rdma_bindings.rs"))
        .expect("couldn't write bindings");
}
