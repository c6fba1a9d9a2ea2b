pub mod buffer;
pub mod executor;
pub mod kcov;

pub use executor::Executor;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAIL: i32 = 1;
pub const EXIT_ERROR: i32 = 2;

/// Terminates the process on a precondition violated by the workload itself
/// (malformed path, oversized buffer range). Such a sequence is broken input,
/// not a testable filesystem outcome, so nothing is recorded and nothing is
/// dumped.
pub(crate) fn fatal(msg: impl AsRef<str>) -> ! {
    eprintln!("[ERROR] {}", msg.as_ref());
    std::process::exit(EXIT_ERROR);
}
