//! Stderr progress for the command-line tools.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    fn spinner(template: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = Self::spinner("{spinner} {msg}");
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Running frame counter for a video pass. Plain mode prints every `every` frames.
    pub fn frames(&self, name: &str, every: u64) -> FrameProgress {
        let spinner = if self.use_pretty() {
            let spinner = Self::spinner("{spinner} {msg} {pos} frames ({per_sec})");
            spinner.set_message(name.to_string());
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        FrameProgress {
            name: name.to_string(),
            start: Instant::now(),
            every: every.max(1),
            frames: 0,
            alerts: 0,
            spinner,
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

pub struct FrameProgress {
    name: String,
    start: Instant,
    every: u64,
    frames: u64,
    alerts: u64,
    spinner: Option<ProgressBar>,
}

impl FrameProgress {
    pub fn tick(&mut self, alerts: usize) {
        self.frames += 1;
        self.alerts += alerts as u64;
        match &self.spinner {
            Some(spinner) => {
                spinner.set_position(self.frames);
                if alerts > 0 {
                    spinner.set_message(format!("{} [{} alerts]", self.name, self.alerts));
                }
            }
            None if self.frames % self.every == 0 => {
                eprintln!("    {} frames, {} alerts", self.frames, self.alerts);
            }
            None => {}
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Drop for FrameProgress {
    fn drop(&mut self) {
        let message = format!(
            "✔ {}: {} frames, {} alerts ({})",
            self.name,
            self.frames,
            self.alerts,
            format_duration(self.start.elapsed())
        );
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
