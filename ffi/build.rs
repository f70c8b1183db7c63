//! Generate `volley.h` from the `extern "C"` surface into `OUT_DIR`.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/types.rs");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
    let Ok(out_dir) = env::var("OUT_DIR").map(PathBuf::from) else {
        println!("cargo:warning=OUT_DIR is not set; skipping volley.h");
        return;
    };
    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("VOLLEY_H".to_string()),
        cpp_compat: true,
        ..Default::default()
    };

    // A header failure must not break the library build.
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            let header = out_dir.join("volley.h");
            bindings.write_to_file(&header);
            println!("cargo:rustc-env=VOLLEY_HEADER={}", header.display());
        }
        Err(e) => println!("cargo:warning=cbindgen failed: {e}"),
    }
}
