// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress reporting for the step that is currently running.

use indicatif::ProgressBar;

pub trait Ui {
    /// Describes what the current step is doing right now.
    fn set_substep(&self, substep: &str);

    /// Runs `f` with the progress display out of the way, so that a child
    /// process can write to the terminal directly.
    fn suspend(&self, f: &mut dyn FnMut());
}

/// The [`Ui`] handed to a running step: a spinner line when interactive,
/// plain indented lines otherwise.
pub struct StepUi<'a> {
    label: &'a str,
    bar: Option<&'a ProgressBar>,
}

impl<'a> StepUi<'a> {
    pub fn new(label: &'a str, bar: Option<&'a ProgressBar>) -> Self {
        Self { label, bar }
    }
}

impl Ui for StepUi<'_> {
    fn set_substep(&self, substep: &str) {
        tracing::debug!(step = self.label, "{substep}");
        match self.bar {
            Some(bar) => bar.set_message(format!("{}: {}", self.label, substep)),
            None => println!("    {substep}"),
        }
    }

    fn suspend(&self, f: &mut dyn FnMut()) {
        match self.bar {
            Some(bar) => bar.suspend(f),
            None => f(),
        }
    }
}

/// A [`Ui`] that shows nothing, for running steps outside a script.
pub struct SilentUi;

impl Ui for SilentUi {
    fn set_substep(&self, substep: &str) {
        tracing::debug!("{substep}");
    }

    fn suspend(&self, f: &mut dyn FnMut()) {
        f()
    }
}
