use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::session::{SessionState, SessionView};

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

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = spinner();
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    pub fn session_notice(&self) -> SessionNotice {
        SessionNotice {
            pretty: self.use_pretty(),
            spinner: None,
            shown: None,
        }
    }
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner
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

/// Operator-facing text for each session state.
pub fn notice_text(state: SessionState) -> &'static str {
    match state {
        SessionState::Starting => "Activando cámara...",
        SessionState::Connecting => "Conectando con cámara...",
        SessionState::Running => "¡Cámara conectada! Sistema de monitoreo activo",
        SessionState::Stopping => "Deteniendo sistema, cerrando conexión con cámara...",
        SessionState::Stopped => "Sistema detenido",
    }
}

/// The status notice shown while a start or stop sequence runs: a spinner
/// on a terminal, one line per state change otherwise.
pub struct SessionNotice {
    pretty: bool,
    spinner: Option<ProgressBar>,
    shown: Option<SessionState>,
}

impl SessionNotice {
    pub fn update(&mut self, view: &SessionView) {
        if !view.notice_visible {
            self.dismiss();
            return;
        }
        if self.shown == Some(view.state) {
            return;
        }
        self.shown = Some(view.state);
        let text = notice_text(view.state);
        if !self.pretty {
            eprintln!("==> {}", text);
            return;
        }
        if view.state.is_transient() {
            self.spinner.get_or_insert_with(spinner).set_message(text);
        } else {
            match self.spinner.take() {
                Some(spinner) => spinner.finish_with_message(format!("✔ {text}")),
                None => eprintln!("✔ {text}"),
            }
        }
    }

    pub fn dismiss(&mut self) {
        self.shown = None;
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

impl Drop for SessionNotice {
    fn drop(&mut self) {
        self.dismiss();
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_has_notice_text() {
        assert_eq!(notice_text(SessionState::Starting), "Activando cámara...");
        assert_eq!(notice_text(SessionState::Connecting), "Conectando con cámara...");
        assert!(notice_text(SessionState::Running).starts_with("¡Cámara conectada!"));
        assert_eq!(notice_text(SessionState::Stopped), "Sistema detenido");
    }

    #[test]
    fn pretty_needs_a_terminal() {
        assert!(!Ui::from_args(Some("pretty"), false, false).use_pretty());
        assert!(Ui::from_args(Some("pretty"), true, true).use_pretty());
        assert!(!Ui::from_args(Some("auto"), true, true).use_pretty());
        assert!(!Ui::from_args(Some("plain"), true, false).use_pretty());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
