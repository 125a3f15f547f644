use std::process::Command;

// Stamps the binary with the current commit so dev builds report
// "dev@<hash>" instead of the last released version number.
fn main() {
    // New commits and checkouts move HEAD; rebuild the stamp when they do
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");

    let hash = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_default();
    let on_tag = git(&["describe", "--exact-match", "--tags", "HEAD"]).is_some();

    println!("cargo:rustc-env=GIT_HASH={hash}");
    println!("cargo:rustc-env=ON_RELEASE_TAG={on_tag}");
}

/// Run one git command, returning its trimmed stdout on success. Outside a
/// work tree (e.g. a crates.io build) every call comes back `None`.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
