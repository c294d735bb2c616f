use std::env;
use std::process::Command;

use time::OffsetDateTime;
use time::macros::format_description;

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-env-changed=PEACHY_GIT_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    println!("cargo:rustc-env=PEACHY_GIT_SHA={}", git_sha());
    println!("cargo:rustc-env=PEACHY_BUILD_DATE={}", build_date());
}

/// Packagers building from a tarball can pass the revision in; otherwise ask git.
fn git_sha() -> String {
    if let Some(sha) = env::var("PEACHY_GIT_SHA").ok().filter(|s| !s.trim().is_empty()) {
        return sha.trim().to_string();
    }
    Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "dev".to_string())
}

/// Calendar date only, honouring reproducible-build timestamps.
fn build_date() -> String {
    let when = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    when.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| "unknown".to_string())
}
