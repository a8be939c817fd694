pub use anyhow::Context;
pub use anyhow::Error;
pub use anyhow::anyhow;
pub use anyhow::bail;
use crossbeam_queue::SegQueue;
use std::fmt::Write as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("weld: error: {error:#}");
    std::process::exit(1);
}

/// Collects semantic link errors from parallel regions. Workers report
/// diagnostics and keep going so that a single invocation surfaces as many
/// problems as possible. Each phase boundary calls `checkpoint`, which aborts
/// the link if anything was reported.
pub(crate) struct ErrorSink {
    diagnostics: SegQueue<Error>,
    has_errors: AtomicBool,
}

impl ErrorSink {
    pub(crate) fn new() -> Self {
        Self {
            diagnostics: SegQueue::new(),
            has_errors: AtomicBool::new(false),
        }
    }

    pub(crate) fn report(&self, error: Error) {
        self.has_errors.store(true, Ordering::Relaxed);
        self.diagnostics.push(error);
    }

    pub(crate) fn checkpoint(&self) -> Result {
        if !self.has_errors.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut message = String::new();
        let mut count = 0;
        while let Some(diagnostic) = self.diagnostics.pop() {
            if count > 0 {
                message.push('\n');
            }
            let _ = write!(&mut message, "{diagnostic:#}");
            count += 1;
        }
        if count == 1 {
            bail!("{message}");
        }
        bail!("{count} errors\n{message}");
    }
}

/// Prints a warning. Using our own function for this makes it easy to find
/// the places that issue warnings if we later add a flag to suppress them.
pub(crate) fn warning(message: &str) {
    eprintln!("weld: warning: {message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_collects_all_diagnostics() {
        let sink = ErrorSink::new();
        assert!(sink.checkpoint().is_ok());
        sink.report(anyhow!("duplicate symbol: foo"));
        sink.report(anyhow!("duplicate symbol: bar"));
        let message = sink.checkpoint().unwrap_err().to_string();
        assert!(message.contains("foo"));
        assert!(message.contains("bar"));
    }
}
