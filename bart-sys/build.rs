fn main() {
    // Only emit link directives when the `bart-sdk` feature is enabled.
    // This allows the crate to compile without BART installed.
    #[cfg(feature = "bart-sdk")]
    {
        use std::env;
        use std::path::PathBuf;

        println!("cargo:rerun-if-env-changed=BART_LIB_DIR");
        println!("cargo:rerun-if-env-changed=BART_LINK_STATIC");

        if let Ok(lib_dir) = env::var("BART_LIB_DIR") {
            let lib_path = PathBuf::from(&lib_dir);
            if !lib_path.exists() {
                // Libraries may still be installed globally; warn rather than panic.
                println!(
                    "cargo:warning=BART_LIB_DIR does not exist: {}",
                    lib_path.display()
                );
            }
            println!("cargo:rustc-link-search=native={}", lib_path.display());
        }

        let kind = if env::var("BART_LINK_STATIC").is_ok() {
            "static"
        } else {
            "dylib"
        };
        println!("cargo:rustc-link-lib={kind}=bart");

        // BART's numerical kernels depend on these at link time.
        for lib in ["fftw3f", "fftw3f_threads", "lapacke", "blas", "m"] {
            println!("cargo:rustc-link-lib=dylib={lib}");
        }
    }
}
