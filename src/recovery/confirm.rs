use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

pub const PROMPT: &str = "Factory Restore will delete all user data, are you sure? [y/N] ";

const PRINTK_QUIET: &str = "0 0 0 0";
const PRINTK_DEFAULT: &str = "4 4 1 7";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Proceed,
    Declined,
    TimedOut,
}

impl Confirmation {
    pub fn from_key(key: char) -> Self {
        match key {
            'y' | 'Y' => Confirmation::Proceed,
            _ => Confirmation::Declined,
        }
    }

    pub fn proceeds(self) -> bool {
        self == Confirmation::Proceed
    }
}

/// Asks whoever is at the console before user data is destroyed.
pub trait UserPrompt {
    fn confirm(&mut self, timeout: Duration) -> Result<Confirmation>;
}

/// Wait for the first key or the timeout, whichever comes first.
pub fn wait_for_key(keys: Receiver<char>, timeout: Duration) -> Confirmation {
    match keys.recv_timeout(timeout) {
        Ok(key) => Confirmation::from_key(key),
        Err(RecvTimeoutError::Timeout) => Confirmation::TimedOut,
        Err(RecvTimeoutError::Disconnected) => Confirmation::Declined,
    }
}

struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        println!();
    }
}

/// Single keystroke from the console in raw mode, kernel messages silenced
/// while the question is on screen.
pub struct TerminalPrompt {
    printk: PathBuf,
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self {
            printk: PathBuf::from("/proc/sys/kernel/printk"),
        }
    }
}

impl TerminalPrompt {
    fn set_printk(&self, levels: &str) {
        if let Err(e) = fs::write(&self.printk, levels) {
            debug!("printk {levels}: {e}");
        }
    }

    fn ask(&self, timeout: Duration) -> Result<Confirmation> {
        print!("{PROMPT}");
        io::stdout().flush()?;

        enable_raw_mode()?;
        let _guard = RawModeGuard;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            loop {
                match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                        let c = match key.code {
                            KeyCode::Char(c) => c,
                            _ => '\n',
                        };
                        let _ = tx.send(c);
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });
        Ok(wait_for_key(rx, timeout))
    }
}

impl UserPrompt for TerminalPrompt {
    fn confirm(&mut self, timeout: Duration) -> Result<Confirmation> {
        self.set_printk(PRINTK_QUIET);
        let answer = self.ask(timeout);
        self.set_printk(PRINTK_DEFAULT);
        let answer = answer?;
        info!("factory restore confirmation: {answer:?}");
        Ok(answer)
    }
}
