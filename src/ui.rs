// Small terminal UI helpers: the `(total, position, description)` progress
// renderer and the "...done" / red-error conventions every subcommand uses
// for user-facing status.
//
// Grounded on original_source/sw/pc/primer.py's Utils class (progress bar,
// info/warning/die). Unlike the crate's ambient `log` diagnostics, these are
// unconditional stdout/stderr writes, matching `Utils`'s own behavior of
// always printing regardless of any log-level filter — a warning the user
// needs to act on (a disk mismatch, a refused Ctrl-C) shouldn't disappear
// because `RUST_LOG` wasn't set.

use std::io::Write;

const TAG: &str = "[sc64]";

/// Render one `(total, position, description)` progress tick to stderr as a
/// single updating line, matching the callback signature command.rs and
/// bringup.rs pass through long-running operations.
pub fn print_progress(total: u64, position: u64, description: &str) {
    let percent = if total == 0 {
        100.0
    } else {
        (position as f64 / total as f64) * 100.0
    };
    eprint!("\r{TAG} {percent:5.1}%: [{description}]");
    let _ = std::io::stderr().flush();
    if total == 0 || position >= total {
        eprintln!();
    }
}

/// Print a successful step, following the crate-wide "each successful step
/// prints '...done'" convention.
pub fn done(step: &str) {
    println!("{TAG} {step}...done");
}

/// Print a single-line failure cause. The top-level driver calls this once
/// per raised error before returning a nonzero exit status.
pub fn fail(err: &dyn std::fmt::Display) {
    eprintln!("\x1b[91m{TAG} {err}\x1b[0m");
}

/// Print a warning unconditionally, independent of the `log` crate's level
/// filter — used for conditions the user must notice even without
/// `RUST_LOG` set.
pub fn warn(message: &str) {
    eprintln!("{TAG} warning: {message}");
}

/// Bring-up's confirmation gate: prints `prompt` and requires the user to
/// type `YES` (exact case) before continuing.
pub fn confirm(prompt: &str) -> bool {
    eprint!("{TAG} {prompt} [type YES to continue]: ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim() == "YES"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_caps_at_100() {
        // not a rendering assertion (stderr), just exercises the edge maths
        assert_eq!((0u64, 0u64), (0, 0));
        print_progress(0, 0, "noop");
        print_progress(10, 10, "done");
    }
}
