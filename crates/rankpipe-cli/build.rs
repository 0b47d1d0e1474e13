//! Embeds a revision string and the build profile for `rankpipe --version`.

use std::env;
use std::path::Path;
use std::process::Command;

const REVISION_ENV: &str = "RANKPIPE_GIT_HASH";

fn describe(repo: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?;
    Some(revision.trim().to_owned()).filter(|r| !r.is_empty())
}

fn main() {
    let manifest = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into());
    let repo = Path::new(&manifest).join("../..");

    let head = repo.join(".git/HEAD");
    if head.exists() {
        println!("cargo::rerun-if-changed={}", head.display());
        println!("cargo::rerun-if-changed={}", repo.join(".git/index").display());
    }
    println!("cargo::rerun-if-env-changed={REVISION_ENV}");

    // Packagers without a checkout can pin the revision explicitly.
    let revision = env::var(REVISION_ENV)
        .ok()
        .filter(|r| !r.is_empty())
        .or_else(|| describe(&repo))
        .unwrap_or_else(|| "unknown".into());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".into());

    println!("cargo::rustc-env={REVISION_ENV}={revision}");
    println!("cargo::rustc-env=RANKPIPE_BUILD_PROFILE={profile}");
}
