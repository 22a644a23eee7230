//! HID keyboard reports and timed keystroke macros for typing a code into the host.
use heapless::Vec as HeaplessVec;
use rand_core::RngCore;

use crate::config::TypingProfile;

pub const KEYBOARD_ROLLOVER: usize = 6;
pub const HID_REPORT_SIZE: usize = KEYBOARD_ROLLOVER + 2;
/// Room for eight digits plus Enter, four steps each.
pub const MACRO_BUFFER_CAPACITY: usize = 40;

const USAGE_DIGIT_ONE: u8 = 0x1E;
const USAGE_DIGIT_ZERO: u8 = 0x27;
const USAGE_ENTER: u8 = 0x28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TypingError {
    #[error("character {0:?} has no keyboard mapping")]
    UnsupportedCharacter(char),
    #[error("keystroke buffer is full")]
    BufferFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyboardReport {
    pub modifiers: u8,
    pub keys: [u8; KEYBOARD_ROLLOVER],
}

impl KeyboardReport {
    pub const fn empty() -> Self {
        Self {
            modifiers: 0,
            keys: [0; KEYBOARD_ROLLOVER],
        }
    }

    pub const fn key(usage: u8) -> Self {
        let mut report = Self::empty();
        report.keys[0] = usage;
        report
    }

    pub fn to_bytes(&self) -> [u8; HID_REPORT_SIZE] {
        let mut data = [0u8; HID_REPORT_SIZE];
        data[0] = self.modifiers;
        data[2..].copy_from_slice(&self.keys);
        data
    }

    pub fn is_release(&self) -> bool {
        self.modifiers == 0 && self.keys.iter().all(|key| *key == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroStep {
    Delay(u16),
    Report(KeyboardReport),
}

/// Fixed-capacity sequence of reports and delays, replayed by the USB/HID task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MacroBuffer {
    steps: HeaplessVec<MacroStep, MACRO_BUFFER_CAPACITY>,
}

impl MacroBuffer {
    pub const fn new() -> Self {
        Self {
            steps: HeaplessVec::new(),
        }
    }

    pub fn push(&mut self, step: MacroStep) -> Result<(), TypingError> {
        self.steps.push(step).map_err(|_| TypingError::BufferFull)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacroStep> {
        self.steps.iter()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Key presses in order, ignoring releases and delays.
    pub fn pressed_usages(&self) -> impl Iterator<Item = u8> + '_ {
        self.steps.iter().filter_map(|step| match step {
            MacroStep::Report(report) if !report.is_release() => Some(report.keys[0]),
            _ => None,
        })
    }
}

/// USB or BLE HID endpoint that replays keystroke macros on the host.
pub trait HidTransport {
    fn transmit(&mut self, keystrokes: &MacroBuffer);
}

pub fn usage_for_char(ch: char) -> Option<u8> {
    match ch {
        '0' => Some(USAGE_DIGIT_ZERO),
        '1'..='9' => Some(USAGE_DIGIT_ONE + (ch as u8 - b'1')),
        '\n' => Some(USAGE_ENTER),
        _ => None,
    }
}

/// Turn `code` into press, hold, release and gap steps with random jitter on every delay.
pub fn type_code<G: RngCore + ?Sized>(
    code: &str,
    profile: &TypingProfile,
    rng: &mut G,
) -> Result<MacroBuffer, TypingError> {
    let mut buffer = MacroBuffer::new();
    for ch in code.chars() {
        let usage = usage_for_char(ch).ok_or(TypingError::UnsupportedCharacter(ch))?;
        push_keystroke(&mut buffer, usage, profile, rng)?;
    }
    if profile.submit_with_enter {
        push_keystroke(&mut buffer, USAGE_ENTER, profile, rng)?;
    }
    Ok(buffer)
}

fn push_keystroke<G: RngCore + ?Sized>(
    buffer: &mut MacroBuffer,
    usage: u8,
    profile: &TypingProfile,
    rng: &mut G,
) -> Result<(), TypingError> {
    buffer.push(MacroStep::Report(KeyboardReport::key(usage)))?;
    buffer.push(MacroStep::Delay(jittered(profile.hold_ms, profile.jitter_ms, rng)))?;
    buffer.push(MacroStep::Report(KeyboardReport::empty()))?;
    buffer.push(MacroStep::Delay(jittered(profile.gap_ms, profile.jitter_ms, rng)))
}

fn jittered<G: RngCore + ?Sized>(base_ms: u16, jitter_ms: u16, rng: &mut G) -> u16 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let offset = rng.next_u32() % (u32::from(jitter_ms) + 1);
    base_ms.saturating_add(offset as u16)
}
