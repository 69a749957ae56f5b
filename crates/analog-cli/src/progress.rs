//! Terminal progress for monthly ingestion.

use std::cell::RefCell;

use analog_core::{MonthInYear, pipeline::Progress};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} records ({eta})";

/// One progress bar per ingested month.
#[derive(Default)]
pub struct MonthBars {
    current: RefCell<Option<ProgressBar>>,
    hidden: bool,
}

impl MonthBars {
    /// Bars drawn to stderr; indicatif hides them when stderr is not a terminal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bars that never draw.
    #[cfg(test)]
    pub fn hidden() -> Self {
        Self {
            current: RefCell::new(None),
            hidden: true,
        }
    }

    fn bar(&self, records: u64) -> ProgressBar {
        let bar = if self.hidden {
            ProgressBar::with_draw_target(Some(records), ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new(records)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar
    }

    #[cfg(test)]
    fn position(&self) -> Option<u64> {
        self.current.borrow().as_ref().map(ProgressBar::position)
    }
}

impl Progress for MonthBars {
    fn begin_month(&self, month: MonthInYear, records: u64) {
        let bar = self.bar(records);
        bar.set_message(month.to_string());
        if let Some(previous) = self.current.replace(Some(bar)) {
            previous.abandon();
        }
    }

    fn advance(&self, n: u64) {
        if let Some(bar) = self.current.borrow().as_ref() {
            bar.inc(n);
        }
    }

    fn finish_month(&self, month: MonthInYear) {
        if let Some(bar) = self.current.borrow_mut().take() {
            bar.finish_with_message(format!("{month} done"));
        }
    }
}
