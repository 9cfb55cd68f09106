//! Per-transfer progress display

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::transfer::{Direction, Transfer};

pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(transfer: &Transfer) -> Self {
        Self::with_target(transfer, ProgressDrawTarget::stderr())
    }

    /// Progress that draws nothing (tests, non-interactive use)
    pub fn hidden(transfer: &Transfer) -> Self {
        Self::with_target(transfer, ProgressDrawTarget::hidden())
    }

    fn with_target(transfer: &Transfer, target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(transfer.declared_size), target);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        let arrow = match transfer.direction {
            Direction::Send => "send",
            Direction::Receive => "recv",
        };
        bar.set_prefix(format!("{} #{} {}", arrow, transfer.id, transfer.name));
        Self { bar }
    }

    pub fn set(&self, bytes_complete: u64) {
        self.bar.set_position(bytes_complete);
    }

    pub fn finish(&self, msg: &str) {
        self.bar.finish_with_message(msg.to_string());
    }

    pub fn abandon(&self, msg: &str) {
        self.bar.abandon_with_message(msg.to_string());
    }
}
