use std::process::Command;

fn main() {
    // The exact compiler version is baked into every plugin declaration so the
    // loader can refuse modules built by a different toolchain.
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=REPLUG_RUSTC_VERSION={version}");
}
