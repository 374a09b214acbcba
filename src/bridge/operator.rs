//! # Operator Input
//!
//! Single-key commands from the terminal and OS termination signals, both
//! delivered to the orchestrator as [`OperatorCommand`]s.
//!
//! | Key              | Command |
//! |------------------|---------|
//! | `a`              | Arm     |
//! | `u`              | Disarm  |
//! | `q`, Esc, Ctrl-C | Quit    |

use std::io::IsTerminal;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEY_POLL: Duration = Duration::from_millis(200);

/// A request from the person at the keyboard (or the OS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Arm,
    Disarm,
    Quit,
}

/// Map a key press to a command
pub fn command_for_key(key: &KeyEvent) -> Option<OperatorCommand> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(OperatorCommand::Quit)
        }
        KeyCode::Char('a' | 'A') => Some(OperatorCommand::Arm),
        KeyCode::Char('u' | 'U') => Some(OperatorCommand::Disarm),
        KeyCode::Char('q' | 'Q') | KeyCode::Esc => Some(OperatorCommand::Quit),
        _ => None,
    }
}

/// Restores cooked terminal mode when dropped
#[derive(Debug)]
pub struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

/// Start reading keys, if stdin is a terminal
///
/// The reader stops once `commands` is closed. Keep the guard alive for
/// as long as keys should be read.
pub fn spawn_keyboard(
    commands: mpsc::Sender<OperatorCommand>,
) -> Option<(RawModeGuard, JoinHandle<()>)> {
    if !std::io::stdin().is_terminal() {
        debug!("stdin is not a terminal, keyboard commands disabled");
        return None;
    }
    if let Err(e) = terminal::enable_raw_mode() {
        warn!("Cannot enable raw terminal mode: {}", e);
        return None;
    }
    info!("Keys: [a]rm, [u] disarm, [q]uit");

    let handle = tokio::task::spawn_blocking(move || {
        while !commands.is_closed() {
            match event::poll(KEY_POLL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!("Keyboard read failed: {}", e);
                    return;
                }
            }
            let key = match event::read() {
                Ok(Event::Key(key)) => key,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Keyboard read failed: {}", e);
                    return;
                }
            };
            if let Some(cmd) = command_for_key(&key) {
                debug!("Operator {:?}", cmd);
                if commands.blocking_send(cmd).is_err() {
                    return;
                }
            }
        }
    });
    Some((RawModeGuard, handle))
}

/// Turn SIGINT / SIGTERM into [`OperatorCommand::Quit`]
pub async fn watch_signals(commands: mpsc::Sender<OperatorCommand>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("Cannot watch SIGTERM: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            _ = term.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = commands.send(OperatorCommand::Quit).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_key_commands() {
        let none = KeyModifiers::NONE;
        assert_eq!(command_for_key(&press(KeyCode::Char('a'), none)), Some(OperatorCommand::Arm));
        assert_eq!(
            command_for_key(&press(KeyCode::Char('U'), KeyModifiers::SHIFT)),
            Some(OperatorCommand::Disarm)
        );
        assert_eq!(command_for_key(&press(KeyCode::Char('q'), none)), Some(OperatorCommand::Quit));
        assert_eq!(
            command_for_key(&press(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(OperatorCommand::Quit)
        );
        assert_eq!(command_for_key(&press(KeyCode::Char('c'), none)), None);
        assert_eq!(command_for_key(&press(KeyCode::Enter, none)), None);
    }

    #[test]
    fn test_key_release_ignored() {
        let mut key = press(KeyCode::Char('a'), KeyModifiers::NONE);
        key.kind = KeyEventKind::Release;
        assert_eq!(command_for_key(&key), None);
    }
}
