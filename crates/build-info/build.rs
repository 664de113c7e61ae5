use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=NOD_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    if let Some(path) = head_ref_path() {
        println!("cargo:rerun-if-changed={}", path);
    }

    let git_label = git_describe().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("NOD_BUILD_ID_OVERRIDE").unwrap_or_else(|_| {
        format!(
            "{} | {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            git_label
        )
    });

    println!("cargo:rustc-env=NOD_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=NOD_BUILD_GIT={}", git_label);
}

fn head_ref_path() -> Option<String> {
    let head = fs::read_to_string(".git/HEAD").ok()?;
    let reference = head.strip_prefix("ref: ")?.trim();
    let path = format!(".git/{}", reference);
    Path::new(&path).exists().then_some(path)
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
