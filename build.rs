use std::env;
#[cfg(feature = "verbs")]
use std::{env::consts, path::Path, process::Command};

#[cfg(feature = "verbs")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerbsVersion {
    V4,
    V5,
}

#[cfg(feature = "verbs")]
struct VerbsLink {
    ver: VerbsVersion,
    include_dirs: Vec<String>,
}

/// Try to link to existing `MLNX_OFED` installation.
#[cfg(feature = "verbs")]
fn link_mlnx_ofed() -> Result<VerbsLink, ()> {
    let output = Command::new("ofed_info")
        .arg("-n")
        .output()
        .map_err(|_| ())?;

    let ver_num = output.stdout.first().ok_or(())?;
    match *ver_num {
        b'4' => {
            // MLNX_OFED v4.9-x LTS will not register the `libibverbs` library to
            // `pkg-config`, so search for it manually.
            let lib_dir = match env::var("MLNX_OFED_LIB_DIR") {
                Ok(lib_dir) => Path::new(&lib_dir).to_owned(),
                Err(_) => Path::new("/usr/lib").to_owned(),
            };

            let dylib_name = format!("{}ibverbs{}", consts::DLL_PREFIX, consts::DLL_SUFFIX);
            if !lib_dir.join(dylib_name).exists() && !lib_dir.join("libibverbs.a").exists() {
                return Err(());
            }
            println!("cargo:rustc-link-search=native={}", lib_dir.display());
            println!("cargo:rustc-link-lib=ibverbs");

            let include_dirs = env::var("MLNX_OFED_INCLUDE_DIR").map_or_else(|_| Vec::new(), |dir| vec![dir]);
            Ok(VerbsLink {
                ver: VerbsVersion::V4,
                include_dirs,
            })
        }
        b'5' => link_rdma_core(),
        _ => Err(()),
    }
}

/// Try to link to an `rdma-core` installation registered to `pkg-config`.
#[cfg(feature = "verbs")]
fn link_rdma_core() -> Result<VerbsLink, ()> {
    let lib = pkg_config::Config::new()
        .atleast_version("1.8.28")
        .statik(false)
        .probe("libibverbs")
        .map_err(|_| ())?;

    Ok(VerbsLink {
        ver: VerbsVersion::V5,
        include_dirs: lib
            .include_paths
            .iter()
            .filter_map(|p| p.to_str().map(str::to_owned))
            .collect(),
    })
}

/// Build flow:
///
/// 1. Without the `verbs` feature, nothing is linked and the in-process
///    verbs provider is used.
/// 2. Otherwise, try to link to an existing `MLNX_OFED` installation.
/// 3. If failed, try to link to an existing `rdma-core` installation.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_VERBS");

    if env::var_os("CARGO_FEATURE_VERBS").is_none() {
        return;
    }

    #[cfg(feature = "verbs")]
    {
        // Refuse to compile on non-64-bit platforms.
        if cfg!(not(target_pointer_width = "64")) {
            panic!("`rrmsg` only supports libibverbs on 64-bit platforms");
        }

        println!("cargo:rerun-if-changed=src/rdma/verbs/hw/verbs.h");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_LIB_DIR");

        let link = link_mlnx_ofed()
            .or_else(|_| link_rdma_core())
            .expect("cannot find a libibverbs installation");
        gen_verb_bindings(link);
    }
}

#[cfg(feature = "verbs")]
fn gen_verb_bindings(link: VerbsLink) {
    let include_args = link.include_dirs.iter().map(|p| format!("-I{}", p));
    let builder = bindgen::builder()
        .clang_args(include_args)
        .header("src/rdma/verbs/hw/verbs.h")
        .allowlist_function("ibv_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("_compat_ibv_port_attr")
        .opaque_type("pthread_.*")
        .blocklist_type("ibv_send_wr")
        .blocklist_type("ibv_wc")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_qp_attr_mask")
        .constified_enum_module("ibv_mtu")
        .constified_enum_module("ibv_port_state")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_wr_opcode")
        .constified_enum_module("ibv_qp_type")
        .constified_enum_module("ibv_qp_state")
        .constified_enum_module("ibv_mig_state")
        .constified_enum_module("ibv_srq_type")
        .rustified_enum("ibv_event_type");

    match link.ver {
        VerbsVersion::V4 => println!("cargo:rustc-cfg=mlnx4"),
        VerbsVersion::V5 => println!("cargo:rustc-cfg=mlnx5"),
    }

    let bindings = builder
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .generate_comments(false)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .generate()
        .expect("failed to generate bindings");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is not set");
    let dest = Path::new(&out_dir).join("verbs_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write bindings");
}
