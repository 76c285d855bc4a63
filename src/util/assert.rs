/// Panics with an internal assertion message when `condition` is false.
///
/// Used for invariant violations (programming errors) that must never be masked.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditionally fails with an internal assertion message.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Message of an internal assertion failure, tagged with the crate version.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "Firestore ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}
