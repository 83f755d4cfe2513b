pub use anyhow::Error;
use crossbeam_queue::SegQueue;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Errors fall into two classes. Fatal errors (malformed inputs and the like)
/// propagate straight out as `Result` and stop the link. Reported errors are
/// accumulated here so that one bad relocation doesn't hide the next hundred;
/// the link proceeds to the end of the current phase, then aborts before any
/// later phase can act on the broken state.
pub(crate) struct Diagnostics {
    errors: SegQueue<Error>,
}

impl Diagnostics {
    pub(crate) fn new() -> Self {
        Self {
            errors: SegQueue::new(),
        }
    }

    /// Records an error without stopping the caller. Safe to call from any
    /// thread.
    pub(crate) fn report(&self, error: Error) {
        self.errors.push(error);
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Called at phase boundaries. If any errors were reported during the
    /// phase, prints them all and returns a single error carrying every
    /// message.
    pub(crate) fn check_phase(&self) -> Result {
        if !self.has_errors() {
            return Ok(());
        }
        let mut messages = Vec::new();
        while let Some(error) = self.errors.pop() {
            eprintln!("fold: error: {error:#}");
            messages.push(format!("{error:#}"));
        }
        anyhow::bail!(
            "link failed with {} error(s):\n{}",
            messages.len(),
            messages.join("\n")
        );
    }
}

pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("fold: error: {error:#}");
    std::process::exit(1);
}
