//! Bridge for calling the compute kernel from async context.

use tokio::runtime::{Handle, RuntimeFlavor};

/// Run a potentially long computation without starving the async runtime.
///
/// On a multi-thread runtime the closure runs under
/// [`tokio::task::block_in_place`] so sibling tasks keep making progress.
/// Outside a runtime (or on a current-thread runtime, where `block_in_place`
/// would panic) the closure runs inline.
pub(crate) fn run<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
