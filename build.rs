//! Embeds the source revision shown in the kiosk-cash startup log

use std::process::Command;

fn main() {
    // `git describe` marks builds from a modified tree with -dirty
    let output = Command::new("git").args(["describe", "--always", "--dirty", "--abbrev=8"]).output();

    let git_hash = match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::from("unknown"),
    };

    println!("cargo:rustc-env=GIT_HASH={git_hash}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
