// build.rs
// Optimize release builds for the CPU of the machine doing the compilation.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let profile = env::var("PROFILE").unwrap_or_else(|_| "debug".to_string());

    if profile == "release" {
        // Let rustc use every feature of the build host's CPU. The dense
        // dot-product loops in the predictor benefit from whatever SIMD
        // the host offers without us naming instruction sets explicitly.
        println!("cargo:rustc-flags=-C target-cpu=native");
        eprintln!("[build.rs] Configuring for RELEASE build: applying '-C target-cpu=native'.");
    } else {
        eprintln!(
            "[build.rs] Profile: '{}'. No target-cpu flags applied; compiler defaults in use.",
            profile
        );
    }
}
