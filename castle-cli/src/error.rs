//! Process exit codes.

use castle_core::AppError;

/// The command succeeded.
pub const EXIT_OK: i32 = 0;
/// The user asked for something invalid.
pub const EXIT_USER: i32 = 1;
/// The command failed while running.
pub const EXIT_RUNTIME: i32 = 2;

/// The exit code for the given error: user errors anywhere in the chain win.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let user_error = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<AppError>())
        .any(|cause| matches!(cause, AppError::ConfigInvalid(_) | AppError::NotFound(_)));
    if user_error {
        EXIT_USER
    } else {
        EXIT_RUNTIME
    }
}
