use std::process::Command;

/// Version suffix for `APP_VERSION`: `WALKFORGE_BUILD_HASH` if set (release
/// builds from a tarball), else `git describe`, else "unknown".
fn build_hash() -> String {
    if let Ok(hash) = std::env::var("WALKFORGE_BUILD_HASH") {
        if !hash.trim().is_empty() {
            return hash.trim().to_string();
        }
    }

    Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=GIT_HASH={}", build_hash());
    println!("cargo:rerun-if-env-changed=WALKFORGE_BUILD_HASH");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");
}
