// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered, labelled steps and the loop that runs them with progress output.
//!
//! Both tools are expressed as a [`Script`]: a list of [`ScriptStep`]s that
//! share a [`Context`] and stop at the first failure.

use std::{borrow::Cow, collections::HashMap, io::Write};

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::ui::{StepUi, Ui};

const PROGRESS_TICK_INTERVAL: std::time::Duration =
    std::time::Duration::from_millis(100);

type StepFn = dyn Fn(&mut Context, &dyn Ui) -> anyhow::Result<()>;

/// One labelled unit of work within a [`Script`].
pub struct ScriptStep {
    /// Shown to the user while the step runs and in its outcome line.
    label: Cow<'static, str>,

    /// The work itself.
    func: Box<StepFn>,

    /// Executables this step launches. They must all resolve on `PATH`
    /// before the first step of the script runs.
    prereq_commands: Vec<&'static str>,
}

impl ScriptStep {
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        func: impl Fn(&mut Context, &dyn Ui) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            func: Box::new(func),
            prereq_commands: Vec::new(),
        }
    }

    pub fn with_prereqs(
        label: impl Into<Cow<'static, str>>,
        func: impl Fn(&mut Context, &dyn Ui) -> anyhow::Result<()> + 'static,
        commands: &[&'static str],
    ) -> Self {
        Self {
            label: label.into(),
            func: Box::new(func),
            prereq_commands: commands.to_vec(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn prereq_commands(&self) -> &[&'static str] {
        self.prereq_commands.as_slice()
    }
}

/// Prerequisite problems found before a script runs. Errors prevent the
/// script from running; warnings are printed and the script proceeds.
#[derive(Debug, Default)]
pub struct MissingPrerequisites {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl MissingPrerequisites {
    pub fn from_messages(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { errors, warnings }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

pub trait Script {
    /// The steps to run, in order.
    fn steps(&self) -> &[ScriptStep];

    fn print_configuration(&self, w: &mut dyn Write) -> std::io::Result<()>;

    fn check_prerequisites(&self) -> MissingPrerequisites;

    /// Values the [`Context`] holds before the first step runs.
    fn initial_context(&self) -> HashMap<String, String>;
}

/// Prints the script's configuration, checks its prerequisites and runs its
/// steps, reporting each outcome. Steps run strictly in order; the first failure ends the run.
pub fn run_script(script: &dyn Script, interactive: bool) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    script.print_configuration(&mut stdout)?;
    writeln!(stdout)?;

    let missing = script.check_prerequisites();
    if !missing.warnings().is_empty() {
        println!("{}", "Warnings:".bold().yellow());
        for warning in missing.warnings() {
            println!("  {}", warning);
        }
        println!();
    }

    if !missing.errors().is_empty() {
        println!("{}", "Some prerequisites were not satisfied:".bold());
        for unsatisfied in missing.errors() {
            println!("  {}", unsatisfied);
        }
        println!();
        anyhow::bail!("some script prerequisites weren't satisfied");
    }

    let mut ctx = Context { vars: script.initial_context() };
    let multi = interactive.then(MultiProgress::new);

    let bars: Vec<Option<ProgressBar>> = script
        .steps()
        .iter()
        .map(|step| {
            multi.as_ref().map(|multi| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_message(step.label.clone());
                bar.set_style(dim_style());
                bar.tick();
                bar
            })
        })
        .collect();

    for (step, bar) in script.steps().iter().zip(bars.iter()) {
        tracing::debug!(step = %step.label, "starting step");
        if let Some(bar) = bar {
            bar.set_style(ProgressStyle::default_spinner());
            bar.enable_steady_tick(PROGRESS_TICK_INTERVAL);
        } else {
            println!("  {}", step.label.dimmed());
        }

        let ui = StepUi::new(&step.label, bar.as_ref());
        let result = (step.func)(&mut ctx, &ui);
        finish_step(step, bar.as_ref(), result.is_ok());
        if let Err(e) = result {
            tracing::debug!(step = %step.label, error = %e, "step failed");
            return Err(e.context(format!("step '{}' failed", step.label)));
        }
    }

    Ok(())
}

fn dim_style() -> ProgressStyle {
    ProgressStyle::with_template("  {msg:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn finish_step(step: &ScriptStep, bar: Option<&ProgressBar>, ok: bool) {
    let (template, glyph) = if ok {
        ("✓ {msg:.green}", "✓".green())
    } else {
        ("⚠ {msg:.bold.red}", "⚠".bold().red())
    };

    match bar {
        Some(bar) => {
            bar.set_message(step.label.clone());
            if let Ok(style) = ProgressStyle::with_template(template) {
                bar.set_style(style);
            }
            bar.finish();
        }
        None if ok => println!("{} {}", glyph, step.label.green()),
        None => println!("{} {}", glyph, step.label.bold().red()),
    }
}

/// String values handed from one step to the steps after it, seeded from
/// [`Script::initial_context`].
#[derive(Debug, Default)]
pub struct Context {
    vars: HashMap<String, String>,
}

impl Context {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn get_var(&self, var: &str) -> Option<&str> {
        self.vars.get(var).map(|v| v.as_str())
    }

    /// Like `get_var`, but a missing value is an error. Steps use this for
    /// values an earlier step was supposed to provide.
    pub fn var(&self, var: &str) -> anyhow::Result<&str> {
        self.get_var(var).ok_or_else(|| {
            anyhow::anyhow!("script context has no value for '{var}'")
        })
    }

    /// Stores `value` under `var` and returns whatever it replaced.
    pub fn set_var(&mut self, var: &str, value: String) -> Option<String> {
        self.vars.insert(var.to_owned(), value)
    }
}
