//! Shared fixtures for the crate's tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use chrono::Utc;

use crate::config::{Adjustment, Configuration};

pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "til_{}_test_{}_{}",
        tag,
        process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("create test root");
    root
}

/// Installs an executable `/bin/sh` stub that stands in for one of the
/// external tools.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("mark script executable");
    path
}

#[cfg(unix)]
pub fn command_for(path: &Path) -> Vec<String> {
    vec![path.to_string_lossy().into_owned()]
}

/// A configuration whose domain and problem files really exist under
/// `root`, so path checks in the pipeline hold.
pub fn configuration(
    root: &Path,
    problem_name: &str,
    adjustment: Adjustment,
    time_limit_seconds: u64,
) -> Configuration {
    let domain = root.join("domain.pddl");
    let problem = root.join(format!("{}.pddl", problem_name));
    fs::write(&domain, "(define (domain trucks))\n").expect("write domain file");
    fs::write(&problem, format!("(define (problem {}))\n", problem_name))
        .expect("write problem file");
    Configuration::new(domain, problem, 1 << 30, time_limit_seconds, adjustment)
        .expect("build configuration")
}
