use std::future::Future;
use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinner that turns into a check mark or a cross.
    Normal,
    /// No ANSI: one line per step on stderr (piped/non-TTY, or `-v`).
    Plain,
    /// Nothing at all (`--json`).
    Silent,
}

impl OutputMode {
    pub fn detect(json: bool, verbose: bool) -> Self {
        if json {
            OutputMode::Silent
        } else if verbose || !std::io::stderr().is_terminal() {
            OutputMode::Plain
        } else {
            OutputMode::Normal
        }
    }
}

fn spinner_style() -> Option<ProgressStyle> {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .ok()
}

fn done_style(mark: &str) -> Option<ProgressStyle> {
    ProgressStyle::default_spinner()
        .template(&format!("{mark} {{msg}}"))
        .ok()
}

/// Run `fut` under a labelled spinner. The spinner finishes with a check
/// mark on `Ok` and a cross on `Err`; the result is passed through.
pub async fn step<T, E, Fut>(mode: OutputMode, label: &str, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match mode {
        OutputMode::Silent => fut.await,
        OutputMode::Plain => {
            eprintln!("{label}...");
            let result = fut.await;
            match &result {
                Ok(_) => eprintln!("\u{2713} {label}"),
                Err(_) => eprintln!("\u{2717} {label}"),
            }
            result
        }
        OutputMode::Normal => {
            let bar = ProgressBar::new_spinner();
            if let Some(style) = spinner_style() {
                bar.set_style(style);
            }
            bar.set_message(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(80));

            let result = fut.await;
            let mark = match &result {
                Ok(_) => console::style("\u{2713}").green().to_string(),
                Err(_) => console::style("\u{2717}").red().to_string(),
            };
            if let Some(style) = done_style(&mark) {
                bar.set_style(style);
            }
            bar.finish_with_message(label.to_string());
            result
        }
    }
}

/// An informational line under the steps, suppressed in silent mode.
pub fn info(mode: OutputMode, text: &str) {
    if mode != OutputMode::Silent {
        eprintln!("  \u{2192} {text}");
    }
}
