//! Single-line status output for long-running steps.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

pub(crate) struct Progress {
    bar: ProgressBar,
}

impl Progress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_draw_target(ProgressDrawTarget::stdout());
        bar.set_style(ProgressStyle::with_template("{spinner} {msg} {pos}").unwrap());
        Progress { bar }
    }

    /// Start a new named step; the per-entry counter restarts at zero.
    pub(crate) fn task(&self, msg: impl Into<String>) {
        self.bar.set_position(0);
        self.bar.set_message(msg.into());
    }

    pub(crate) fn advance(&self) {
        self.bar.inc(1);
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
