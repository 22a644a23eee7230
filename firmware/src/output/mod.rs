//! Routing of generated codes to the screen and the emulated keyboard.
//!
//! The backup channel never carries codes; only [`crate::Device::export_backup`] feeds it,
//! with records re-sealed under the transport key.
pub mod display;
pub mod keyboard;

use rand_core::RngCore;
use vault_core::{SecretName, TotpCode};

use crate::config::TypingProfile;
use crate::error::CoreError;

pub use display::{Button, CodeView, DisplayDriver, InputDriver, ListView, LockView};
pub use keyboard::{HidTransport, KeyboardReport, MacroBuffer, MacroStep, TypingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Display,
    KeyboardEmulation,
    BackupChannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Display(CodeView),
    Keystrokes(MacroBuffer),
}

/// Answer to the export prompt on the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportConfirmation {
    Confirmed,
    Declined,
}

impl ExportConfirmation {
    /// Map the button that closed the export prompt.
    pub fn from_button(button: Button) -> Self {
        match button {
            Button::Select => ExportConfirmation::Confirmed,
            _ => ExportConfirmation::Declined,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputRouter {
    typing: TypingProfile,
}

impl OutputRouter {
    pub const fn new(typing: TypingProfile) -> Self {
        Self { typing }
    }

    pub fn emit<G: RngCore + ?Sized>(
        &self,
        name: &SecretName,
        code: &TotpCode,
        sink: Sink,
        rng: &mut G,
    ) -> Result<Emission, CoreError> {
        match sink {
            Sink::Display => Ok(Emission::Display(CodeView::new(name.clone(), code))),
            Sink::KeyboardEmulation => {
                let keystrokes = keyboard::type_code(&code.code, &self.typing, rng)?;
                log::debug!("typing code for {name}, {} steps", keystrokes.len());
                Ok(Emission::Keystrokes(keystrokes))
            }
            Sink::BackupChannel => Err(CoreError::ExportRefused),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn code() -> TotpCode {
        TotpCode {
            code: String::from("755224"),
            counter: 0,
            period: 30,
            remaining_seconds: 12,
        }
    }

    fn name() -> SecretName {
        SecretName::new("mail").unwrap()
    }

    #[test]
    fn display_sink_shows_countdown() {
        let router = OutputRouter::new(TypingProfile::default());
        let mut rng = ChaCha20Rng::from_seed([0u8; 32]);
        match router.emit(&name(), &code(), Sink::Display, &mut rng).unwrap() {
            Emission::Display(view) => {
                assert_eq!(view.code, "755 224");
                assert_eq!(view.remaining_seconds, 12);
            }
            other => panic!("unexpected emission: {other:?}"),
        }
    }

    #[test]
    fn keyboard_sink_types_each_digit() {
        let router = OutputRouter::new(TypingProfile::default());
        let mut rng = ChaCha20Rng::from_seed([0u8; 32]);
        match router
            .emit(&name(), &code(), Sink::KeyboardEmulation, &mut rng)
            .unwrap()
        {
            Emission::Keystrokes(buffer) => assert_eq!(buffer.pressed_usages().count(), 6),
            other => panic!("unexpected emission: {other:?}"),
        }
    }

    #[test]
    fn backup_channel_never_receives_codes() {
        let router = OutputRouter::new(TypingProfile::default());
        let mut rng = ChaCha20Rng::from_seed([0u8; 32]);
        assert_eq!(
            router.emit(&name(), &code(), Sink::BackupChannel, &mut rng),
            Err(CoreError::ExportRefused)
        );
    }

    #[test]
    fn only_select_confirms_export() {
        assert_eq!(
            ExportConfirmation::from_button(Button::Select),
            ExportConfirmation::Confirmed
        );
        assert_eq!(
            ExportConfirmation::from_button(Button::Cancel),
            ExportConfirmation::Declined
        );
    }
}
