//! Text frames for the on-device screen and the driver seams the board implements.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use vault_core::{SecretName, TotpCode};

use crate::unlock::{LockStatus, UnlockPhase};

const PROGRESS_WIDTH: u32 = 10;
const LIST_WINDOW: usize = 4;

/// Physical buttons of the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    Select,
    Cancel,
    Unlock,
    Settings,
    /// Asks the network task for a fresh NTP sync.
    Wifi,
    Sleep,
}

pub trait DisplayDriver {
    fn render(&mut self, text: &str);
}

pub trait InputDriver {
    fn read_input(&mut self) -> Option<Button>;
}

/// A code ready for the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeView {
    pub name: SecretName,
    /// Digits split into two groups, e.g. `123 456`.
    pub code: String,
    pub remaining_seconds: u32,
    pub period: u32,
}

impl CodeView {
    pub fn new(name: SecretName, code: &TotpCode) -> Self {
        Self {
            name,
            code: group_digits(&code.code),
            remaining_seconds: code.remaining_seconds,
            period: code.period,
        }
    }

    /// Filled cells of the validity bar, rounded up so a live code never shows empty.
    pub fn progress_cells(&self) -> u32 {
        if self.period == 0 {
            return 0;
        }
        let remaining = u64::from(self.remaining_seconds.min(self.period));
        let cells = (remaining * u64::from(PROGRESS_WIDTH)).div_ceil(u64::from(self.period));
        cells as u32
    }

    pub fn render_text(&self) -> String {
        let filled = self.progress_cells() as usize;
        let empty = PROGRESS_WIDTH as usize - filled;
        format!(
            "{}\n{}\n[{}{}] {}s",
            self.name,
            self.code,
            "#".repeat(filled),
            "-".repeat(empty),
            self.remaining_seconds
        )
    }
}

pub fn group_digits(code: &str) -> String {
    let split = code.len() / 2;
    match (code.get(..split), code.get(split..)) {
        (Some(head), Some(tail)) if code.len() >= 6 => format!("{head} {tail}"),
        _ => String::from(code),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockView {
    pub prompt: String,
    pub remaining_attempts: Option<u8>,
    pub backoff_remaining_ms: Option<u64>,
    pub locked_out: bool,
}

impl LockView {
    pub fn from_status(status: &LockStatus) -> Self {
        let locked_out = status.phase == UnlockPhase::LockedOut;
        let prompt = if !status.provisioned {
            String::from("Set a PIN")
        } else if locked_out {
            String::from("Device Locked Out")
        } else if status.phase == UnlockPhase::Unlocking {
            String::from("Checking PIN...")
        } else if status.phase == UnlockPhase::Unlocked {
            String::from("Unlocked")
        } else if let Some(ms) = status.backoff_remaining_ms {
            format!("Try again in {}s", ms.div_ceil(1_000))
        } else {
            String::from("Enter PIN")
        };

        Self {
            prompt,
            remaining_attempts: (status.provisioned && !locked_out)
                .then_some(status.remaining_attempts),
            backoff_remaining_ms: status.backoff_remaining_ms,
            locked_out,
        }
    }

    pub fn render_text(&self) -> String {
        let mut text = self.prompt.clone();
        if self.locked_out {
            text.push_str("\nWipe required");
        } else if let Some(remaining) = self.remaining_attempts {
            let _ = write!(text, "\n{remaining} attempts left");
        }
        text
    }
}

/// Scrolling list of secret names with the cursor on `selected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListView {
    pub names: Vec<SecretName>,
    pub selected: usize,
}

impl ListView {
    pub fn render_text(&self) -> String {
        if self.names.is_empty() {
            return String::from("No secrets");
        }
        let start = self
            .selected
            .saturating_sub(LIST_WINDOW - 1)
            .min(self.names.len().saturating_sub(LIST_WINDOW));
        let mut text = String::new();
        for (index, name) in self.names.iter().enumerate().skip(start).take(LIST_WINDOW) {
            if !text.is_empty() {
                text.push('\n');
            }
            let marker = if index == self.selected { '>' } else { ' ' };
            let _ = write!(text, "{marker} {name}");
        }
        text
    }
}
