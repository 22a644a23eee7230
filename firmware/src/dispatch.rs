//! Single-threaded cooperative dispatcher.
//!
//! Events from the board (timer ticks, NTP, buttons, PIN entry, power supervisor) are
//! queued in a bounded channel and handled one per [`Dispatcher::step`]. The key derivation
//! of a submitted PIN is the only step that can exceed a scheduling quantum, so it runs on
//! its own and only once the queue is drained: a cancel or lock queued behind the PIN
//! always wins.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, warn};
use rand_core::{CryptoRng, RngCore};
use vault_core::SecretName;
use zeroize::Zeroizing;

use crate::clock::RealTimeClock;
use crate::device::Device;
use crate::error::CoreError;
use crate::output::{
    Button, DisplayDriver, Emission, HidTransport, InputDriver, MacroBuffer, Sink,
};
use crate::store::{MAX_SECRETS, Region};
use crate::unlock::{LockReason, UnlockJob, UnlockPhase};

pub const EVENT_QUEUE_DEPTH: usize = 8;

/// PIN digits collected by the entry screen. Zeroized on drop and never printed.
pub struct PinEntry(Zeroizing<Vec<u8>>);

impl PinEntry {
    pub fn new(digits: &[u8]) -> Self {
        Self(Zeroizing::new(digits.to_vec()))
    }
}

impl fmt::Debug for PinEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PinEntry(..)")
    }
}

#[derive(Debug)]
pub enum DeviceEvent {
    Tick(u64),
    ClockSync(u64),
    SubmitPin(PinEntry),
    CancelUnlock,
    Lock,
    PowerEvent,
    ShowCode(SecretName),
    TypeCode(SecretName),
    Button(Button),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutput {
    Frame(String),
    Keystrokes(MacroBuffer),
    Error(CoreError),
    Unlocked,
    Locked(LockReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Idle,
    Handled,
    Output(DispatchOutput),
}

struct Queued {
    event: DeviceEvent,
    retries: u8,
}

pub struct Dispatcher<R, G, C, const N: usize = EVENT_QUEUE_DEPTH> {
    device: Device<R, G, C>,
    queue: Channel<NoopRawMutex, Queued, N>,
    pending: Option<UnlockJob>,
    selected: usize,
    sync_requested: bool,
}

impl<R, G, C, const N: usize> Dispatcher<R, G, C, N>
where
    R: Region,
    G: RngCore + CryptoRng,
    C: RealTimeClock,
{
    pub fn new(device: Device<R, G, C>) -> Self {
        Self {
            device,
            queue: Channel::new(),
            pending: None,
            selected: 0,
            sync_requested: false,
        }
    }

    pub fn device(&self) -> &Device<R, G, C> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<R, G, C> {
        &mut self.device
    }

    pub fn into_device(self) -> Device<R, G, C> {
        self.device
    }

    pub fn has_pending_unlock(&self) -> bool {
        self.pending.is_some()
    }

    /// Polled by the network task; a `true` answer is expected to come back as
    /// [`DeviceEvent::ClockSync`].
    pub fn take_sync_request(&mut self) -> bool {
        core::mem::take(&mut self.sync_requested)
    }

    /// Queue an event; a full queue reports [`CoreError::Busy`].
    pub fn post(&self, event: DeviceEvent) -> Result<(), CoreError> {
        self.queue
            .try_send(Queued { event, retries: 0 })
            .map_err(|_| CoreError::Busy)
    }

    pub fn poll_input<I: InputDriver>(&self, input: &mut I) -> Result<bool, CoreError> {
        match input.read_input() {
            Some(button) => self.post(DeviceEvent::Button(button)).map(|()| true),
            None => Ok(false),
        }
    }

    /// Handle one queued event, or run the pending key derivation once the queue is empty.
    pub async fn step(&mut self) -> StepResult {
        if let Ok(queued) = self.queue.try_receive() {
            return self.handle(queued).await;
        }

        let Some(job) = self.pending.take() else {
            return StepResult::Idle;
        };
        debug!("running key derivation for attempt {}", job.attempt());
        match self.device.finish_unlock(job.run()).await {
            Ok(()) => StepResult::Output(DispatchOutput::Unlocked),
            Err(CoreError::Cancelled) => StepResult::Handled,
            Err(err) => StepResult::Output(DispatchOutput::Error(err)),
        }
    }

    pub async fn run_until_idle(&mut self) -> Vec<DispatchOutput> {
        let mut outputs = Vec::new();
        loop {
            match self.step().await {
                StepResult::Idle => return outputs,
                StepResult::Handled => {}
                StepResult::Output(output) => outputs.push(output),
            }
        }
    }

    /// Run until idle, rendering frames and errors and handing keystrokes to the HID task.
    pub async fn drive<D, K>(&mut self, display: &mut D, keyboard: &mut K)
    where
        D: DisplayDriver,
        K: HidTransport,
    {
        for output in self.run_until_idle().await {
            match output {
                DispatchOutput::Frame(text) => display.render(&text),
                DispatchOutput::Keystrokes(keystrokes) => keyboard.transmit(&keystrokes),
                DispatchOutput::Error(err) => {
                    display.render(&self.error_frame(&err));
                }
                DispatchOutput::Unlocked => display.render(&self.home_frame()),
                DispatchOutput::Locked(_) => {
                    display.render(&self.device.lock_view().render_text());
                }
            }
        }
    }

    async fn handle(&mut self, queued: Queued) -> StepResult {
        let Queued { event, retries } = queued;
        let retry = RetryEvent::of(&event);
        match self.dispatch(event).await {
            Ok(Some(output)) => StepResult::Output(output),
            Ok(None) => StepResult::Handled,
            Err(CoreError::Busy) if retries < self.device.config().busy_retry_limit => {
                match retry {
                    Some(event) => {
                        let requeued = Queued {
                            event: event.into_event(),
                            retries: retries + 1,
                        };
                        if self.queue.try_send(requeued).is_ok() {
                            debug!("busy, retry {} queued", retries + 1);
                            return StepResult::Handled;
                        }
                        warn!("queue full, dropping busy retry");
                        StepResult::Output(DispatchOutput::Error(CoreError::Busy))
                    }
                    None => StepResult::Output(DispatchOutput::Error(CoreError::Busy)),
                }
            }
            Err(err) => StepResult::Output(DispatchOutput::Error(err)),
        }
    }

    async fn dispatch(&mut self, event: DeviceEvent) -> Result<Option<DispatchOutput>, CoreError> {
        match event {
            DeviceEvent::Tick(delta) => {
                Ok(self.device.tick(delta).map(DispatchOutput::Locked))
            }
            DeviceEvent::ClockSync(epoch_seconds) => {
                self.sync_requested = false;
                self.device.sync_clock(epoch_seconds).await?;
                Ok(None)
            }
            DeviceEvent::SubmitPin(pin) => {
                let job = self.device.submit_pin(&pin.0).await?;
                self.pending = Some(job);
                Ok(Some(DispatchOutput::Frame(
                    self.device.lock_view().render_text(),
                )))
            }
            DeviceEvent::CancelUnlock => {
                self.pending = None;
                self.device.cancel_unlock().await?;
                Ok(Some(DispatchOutput::Frame(
                    self.device.lock_view().render_text(),
                )))
            }
            DeviceEvent::Lock => self.lock(LockReason::Manual).await,
            DeviceEvent::PowerEvent => {
                self.pending = None;
                let changed = self.device.power_event().await?;
                Ok(changed.then_some(DispatchOutput::Locked(LockReason::PowerEvent)))
            }
            DeviceEvent::ShowCode(name) => self.show_code(&name).await,
            DeviceEvent::TypeCode(name) => self.type_code(&name).await,
            DeviceEvent::Button(button) => self.button(button).await,
        }
    }

    async fn lock(&mut self, reason: LockReason) -> Result<Option<DispatchOutput>, CoreError> {
        self.pending = None;
        let changed = self.device.lock(reason).await?;
        Ok(changed.then_some(DispatchOutput::Locked(reason)))
    }

    async fn show_code(&mut self, name: &SecretName) -> Result<Option<DispatchOutput>, CoreError> {
        match self.device.emit(name, Sink::Display).await? {
            Emission::Display(view) => Ok(Some(DispatchOutput::Frame(view.render_text()))),
            Emission::Keystrokes(keystrokes) => Ok(Some(DispatchOutput::Keystrokes(keystrokes))),
        }
    }

    async fn type_code(&mut self, name: &SecretName) -> Result<Option<DispatchOutput>, CoreError> {
        match self.device.emit(name, Sink::KeyboardEmulation).await? {
            Emission::Keystrokes(keystrokes) => Ok(Some(DispatchOutput::Keystrokes(keystrokes))),
            Emission::Display(view) => Ok(Some(DispatchOutput::Frame(view.render_text()))),
        }
    }

    async fn button(&mut self, button: Button) -> Result<Option<DispatchOutput>, CoreError> {
        match button {
            Button::Up | Button::Down => {
                let count = self.device.list()?.len();
                if count > 0 {
                    self.selected = if button == Button::Up {
                        self.selected.checked_sub(1).unwrap_or(count - 1)
                    } else {
                        (self.selected + 1) % count
                    };
                }
                Ok(Some(DispatchOutput::Frame(self.home_frame())))
            }
            Button::Select => match self.selected_name()? {
                Some(name) => self.show_code(&name).await,
                None => Ok(Some(DispatchOutput::Frame(self.home_frame()))),
            },
            Button::Right => match self.selected_name()? {
                Some(name) => self.type_code(&name).await,
                None => Ok(None),
            },
            Button::Cancel if self.pending.is_some() => {
                self.pending = None;
                self.device.cancel_unlock().await?;
                Ok(Some(DispatchOutput::Frame(
                    self.device.lock_view().render_text(),
                )))
            }
            Button::Sleep => self.lock(LockReason::Manual).await,
            Button::Wifi => {
                self.sync_requested = true;
                debug!("clock sync requested");
                Ok(Some(DispatchOutput::Frame(String::from("Syncing clock..."))))
            }
            Button::Settings if self.device.phase() == UnlockPhase::Unlocked => {
                Ok(Some(DispatchOutput::Frame(self.settings_frame()?)))
            }
            Button::Settings => Ok(Some(DispatchOutput::Frame(self.home_frame()))),
            Button::Cancel | Button::Left | Button::Unlock => Ok(Some(DispatchOutput::Frame(
                self.home_frame(),
            ))),
        }
    }

    /// Clock state and secret count.
    fn settings_frame(&self) -> Result<String, CoreError> {
        let clock = match self.device.now() {
            Ok(_) => "Clock Synced",
            Err(err) => err.user_message(),
        };
        let count = self.device.list()?.len();
        Ok(format!("{clock}\n{count}/{MAX_SECRETS} secrets"))
    }

    fn selected_name(&self) -> Result<Option<SecretName>, CoreError> {
        let names = self.device.list()?;
        Ok(names.into_iter().nth(self.selected))
    }

    /// Secret list while unlocked, lock screen otherwise.
    fn home_frame(&self) -> String {
        if self.device.phase() == UnlockPhase::Unlocked {
            match self.device.list_view(self.selected) {
                Ok(view) => view.render_text(),
                Err(err) => String::from(err.user_message()),
            }
        } else {
            self.device.lock_view().render_text()
        }
    }

    fn error_frame(&self, err: &CoreError) -> String {
        match err {
            CoreError::WrongPin { .. } | CoreError::Backoff { .. } | CoreError::LockedOut => {
                let mut frame = String::from(err.user_message());
                frame.push('\n');
                frame.push_str(&self.device.lock_view().render_text());
                frame
            }
            other => String::from(other.user_message()),
        }
    }
}

/// Events that may be replayed after a `Busy` answer. PIN entries are never replayed:
/// a second verification must come from the user.
enum RetryEvent {
    Tick(u64),
    ClockSync(u64),
    CancelUnlock,
    Lock,
    PowerEvent,
    ShowCode(SecretName),
    TypeCode(SecretName),
    Button(Button),
}

impl RetryEvent {
    fn of(event: &DeviceEvent) -> Option<Self> {
        Some(match event {
            DeviceEvent::Tick(delta) => RetryEvent::Tick(*delta),
            DeviceEvent::ClockSync(epoch) => RetryEvent::ClockSync(*epoch),
            DeviceEvent::SubmitPin(_) => return None,
            DeviceEvent::CancelUnlock => RetryEvent::CancelUnlock,
            DeviceEvent::Lock => RetryEvent::Lock,
            DeviceEvent::PowerEvent => RetryEvent::PowerEvent,
            DeviceEvent::ShowCode(name) => RetryEvent::ShowCode(name.clone()),
            DeviceEvent::TypeCode(name) => RetryEvent::TypeCode(name.clone()),
            DeviceEvent::Button(button) => RetryEvent::Button(*button),
        })
    }

    fn into_event(self) -> DeviceEvent {
        match self {
            RetryEvent::Tick(delta) => DeviceEvent::Tick(delta),
            RetryEvent::ClockSync(epoch) => DeviceEvent::ClockSync(epoch),
            RetryEvent::CancelUnlock => DeviceEvent::CancelUnlock,
            RetryEvent::Lock => DeviceEvent::Lock,
            RetryEvent::PowerEvent => DeviceEvent::PowerEvent,
            RetryEvent::ShowCode(name) => DeviceEvent::ShowCode(name),
            RetryEvent::TypeCode(name) => DeviceEvent::TypeCode(name),
            RetryEvent::Button(button) => DeviceEvent::Button(button),
        }
    }
}
