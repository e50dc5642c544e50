//! Handler side of the three broadcast signals: play a sound, vibrate the controllers, or
//! run the locate pattern until someone finds the headset.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::config::RemoteCommandSettings;
use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteCommand {
    PlaySound,
    Vibrate,
    FindDevice,
}

impl RemoteCommand {
    pub const ALL: [RemoteCommand; 3] = [
        RemoteCommand::PlaySound,
        RemoteCommand::Vibrate,
        RemoteCommand::FindDevice,
    ];

    pub fn action_suffix(self) -> &'static str {
        match self {
            RemoteCommand::PlaySound => "PLAY_SOUND",
            RemoteCommand::Vibrate => "VIBRATE",
            RemoteCommand::FindDevice => "FIND_DEVICE",
        }
    }

    pub fn action(self, package_id: &str) -> String {
        format!("{package_id}.{}", self.action_suffix())
    }

    /// Only the companion package's own actions map to a command.
    pub fn from_action(action: &str, package_id: &str) -> Option<Self> {
        let suffix = action.strip_prefix(package_id)?.strip_prefix('.')?;
        Self::ALL
            .into_iter()
            .find(|command| command.action_suffix() == suffix)
    }

    /// CLI spelling: `sound`, `vibrate`, `locate` and the raw action suffixes.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace('-', "_").as_str() {
            "sound" | "play_sound" | "beep" => Some(RemoteCommand::PlaySound),
            "vibrate" | "haptic" => Some(RemoteCommand::Vibrate),
            "locate" | "find" | "find_device" => Some(RemoteCommand::FindDevice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub duration: Duration,
    pub amplitude: f32,
    pub sample_rate: u32,
}

impl Default for Tone {
    fn default() -> Self {
        Self {
            frequency_hz: 880.0,
            duration: Duration::from_millis(500),
            amplitude: 0.5,
            sample_rate: 44_100,
        }
    }
}

/// Mono sine with a linear fade to silence over the tone's duration.
pub fn beep_samples(tone: &Tone) -> Vec<f32> {
    let duration = tone.duration.as_secs_f32();
    let count = (tone.sample_rate as f32 * duration) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / tone.sample_rate as f32;
            let envelope = 1.0 - t / duration;
            (2.0 * PI * tone.frequency_hz * t).sin() * envelope * tone.amplitude
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Hand {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HapticPulse {
    pub amplitude: f32,
    pub duration: Duration,
}

impl Default for HapticPulse {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            duration: Duration::from_secs(1),
        }
    }
}

/// Audio and haptic output of the device running the handler.
pub trait FeedbackHandler: Send + Sync {
    fn play_tone(&self, tone: &Tone);
    fn vibrate(&self, hand: Hand, pulse: &HapticPulse);
}

/// Stand-in output for hosts without speakers or controllers; renders the tone and logs.
pub struct TracingFeedback;

impl FeedbackHandler for TracingFeedback {
    fn play_tone(&self, tone: &Tone) {
        let samples = beep_samples(tone);
        info!(
            frequency_hz = tone.frequency_hz,
            samples = samples.len(),
            "playing alert tone"
        );
    }

    fn vibrate(&self, hand: Hand, pulse: &HapticPulse) {
        info!(
            hand = ?hand,
            amplitude = pulse.amplitude,
            duration_ms = pulse.duration.as_millis() as u64,
            "vibrating controller"
        );
    }
}

pub struct CommandDispatcher {
    feedback: Arc<dyn FeedbackHandler>,
    tone: Tone,
    pulse: HapticPulse,
    locate_repeats: u32,
    locate_interval: Duration,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandDispatcher {
    pub fn new(feedback: Arc<dyn FeedbackHandler>, settings: &RemoteCommandSettings) -> Self {
        Self {
            feedback,
            tone: Tone::default(),
            pulse: HapticPulse::default(),
            locate_repeats: settings.locate_repeats,
            locate_interval: Duration::from_millis(settings.locate_interval_ms),
            running: Mutex::new(Vec::new()),
        }
    }

    fn vibrate_both(&self) {
        for hand in [Hand::Right, Hand::Left] {
            self.feedback.vibrate(hand, &self.pulse);
        }
    }

    /// The locate pattern runs on its own thread; its handle is returned for callers that wait.
    pub fn dispatch(&self, command: RemoteCommand) -> Option<JoinHandle<()>> {
        info!(command = ?command, "remote command received");
        match command {
            RemoteCommand::PlaySound => {
                self.feedback.play_tone(&self.tone);
                None
            }
            RemoteCommand::Vibrate => {
                self.vibrate_both();
                None
            }
            RemoteCommand::FindDevice => {
                let feedback = Arc::clone(&self.feedback);
                let tone = self.tone.clone();
                let pulse = self.pulse.clone();
                let repeats = self.locate_repeats;
                let interval = self.locate_interval;
                Some(thread::spawn(move || {
                    for round in 0..repeats {
                        feedback.play_tone(&tone);
                        for hand in [Hand::Right, Hand::Left] {
                            feedback.vibrate(hand, &pulse);
                        }
                        if round + 1 < repeats {
                            thread::sleep(interval);
                        }
                    }
                }))
            }
        }
    }

    /// Keeps a locate thread so `wait_idle` can finish it before shutdown.
    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut running) = self.running.lock() {
            running.retain(|handle| !handle.is_finished());
            running.push(handle);
        }
    }

    /// Blocks until every locate pattern started through a receiver has played out.
    pub fn wait_idle(&self) {
        let handles = match self.running.lock() {
            Ok(mut running) => std::mem::take(&mut *running),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("locate thread panicked");
            }
        }
    }
}

pub type ActionHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub type RegistrationId = u64;

/// Where broadcast receivers are registered for a set of action strings.
pub trait BroadcastRegistrar: Send + Sync {
    fn register(&self, actions: &[String], handler: ActionHandler) -> Result<RegistrationId, AppError>;
    fn unregister(&self, id: RegistrationId);
}

struct Receiver {
    id: RegistrationId,
    actions: Vec<String>,
    handler: ActionHandler,
}

/// In-process broadcast delivery.
#[derive(Default)]
pub struct BroadcastBus {
    next_id: AtomicU64,
    receivers: Mutex<Vec<Receiver>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many receivers the action reached.
    pub fn send(&self, action: &str) -> usize {
        let handlers: Vec<ActionHandler> = match self.receivers.lock() {
            Ok(receivers) => receivers
                .iter()
                .filter(|receiver| receiver.actions.iter().any(|known| known == action))
                .map(|receiver| Arc::clone(&receiver.handler))
                .collect(),
            Err(_) => return 0,
        };
        for handler in &handlers {
            handler(action);
        }
        handlers.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.lock().map(|receivers| receivers.len()).unwrap_or(0)
    }
}

impl BroadcastRegistrar for BroadcastBus {
    fn register(&self, actions: &[String], handler: ActionHandler) -> Result<RegistrationId, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut receivers = self
            .receivers
            .lock()
            .map_err(|_| AppError::system("Broadcast bus lock poisoned", ""))?;
        receivers.push(Receiver {
            id,
            actions: actions.to_vec(),
            handler,
        });
        Ok(id)
    }

    fn unregister(&self, id: RegistrationId) {
        if let Ok(mut receivers) = self.receivers.lock() {
            receivers.retain(|receiver| receiver.id != id);
        }
    }
}

/// Maps an action to a command and dispatches it; anything else is ignored.
pub fn route_action(dispatcher: &CommandDispatcher, package_id: &str, action: &str) -> Option<RemoteCommand> {
    match RemoteCommand::from_action(action, package_id) {
        Some(command) => {
            if let Some(handle) = dispatcher.dispatch(command) {
                dispatcher.track(handle);
            }
            Some(command)
        }
        None => {
            debug!(action = %action, "ignoring unknown broadcast action");
            None
        }
    }
}

/// Keeps one receiver for the three actions alive across pause/resume cycles.
pub struct CommandListener {
    registrar: Arc<dyn BroadcastRegistrar>,
    dispatcher: Arc<CommandDispatcher>,
    package_id: String,
    registration: Mutex<Option<RegistrationId>>,
    trace_id: String,
}

impl CommandListener {
    pub fn new(
        registrar: Arc<dyn BroadcastRegistrar>,
        dispatcher: Arc<CommandDispatcher>,
        package_id: &str,
        trace_id: &str,
    ) -> Self {
        Self {
            registrar,
            dispatcher,
            package_id: package_id.to_string(),
            registration: Mutex::new(None),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn actions(&self) -> Vec<String> {
        RemoteCommand::ALL
            .iter()
            .map(|command| command.action(&self.package_id))
            .collect()
    }

    pub fn is_registered(&self) -> bool {
        self.registration
            .lock()
            .map(|registration| registration.is_some())
            .unwrap_or(false)
    }

    /// Idempotent: a second call while registered is a no-op.
    pub fn register(&self) -> Result<(), AppError> {
        let mut registration = self
            .registration
            .lock()
            .map_err(|_| AppError::system("Listener state lock poisoned", &self.trace_id))?;
        if registration.is_some() {
            debug!(trace_id = %self.trace_id, "receiver already registered");
            return Ok(());
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        let package_id = self.package_id.clone();
        let handler: ActionHandler = Arc::new(move |action: &str| {
            route_action(&dispatcher, &package_id, action);
        });
        match self.registrar.register(&self.actions(), handler) {
            Ok(id) => {
                *registration = Some(id);
                info!(trace_id = %self.trace_id, package_id = %self.package_id, "command receiver registered");
                Ok(())
            }
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "failed to register command receiver");
                Err(err)
            }
        }
    }

    pub fn unregister(&self) {
        let id = match self.registration.lock() {
            Ok(mut registration) => registration.take(),
            Err(_) => None,
        };
        if let Some(id) = id {
            self.registrar.unregister(id);
            debug!(trace_id = %self.trace_id, "command receiver unregistered");
        }
    }

    pub fn wait_idle(&self) {
        self.dispatcher.wait_idle();
    }

    /// Some platforms drop receivers while the app is paused.
    pub fn on_resume(&self) -> Result<(), AppError> {
        self.unregister();
        self.register()
    }

    pub fn on_focus(&self, has_focus: bool) -> Result<(), AppError> {
        if has_focus {
            self.on_resume()
        } else {
            Ok(())
        }
    }
}

impl Drop for CommandListener {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGE: &str = "com.ChuJiao.quest3_wireless_adb";

    #[derive(Default)]
    struct RecordingFeedback {
        tones: Mutex<Vec<Tone>>,
        pulses: Mutex<Vec<(Hand, HapticPulse)>>,
    }

    impl FeedbackHandler for RecordingFeedback {
        fn play_tone(&self, tone: &Tone) {
            self.tones.lock().expect("lock").push(tone.clone());
        }

        fn vibrate(&self, hand: Hand, pulse: &HapticPulse) {
            self.pulses.lock().expect("lock").push((hand, pulse.clone()));
        }
    }

    fn dispatcher(feedback: Arc<RecordingFeedback>, repeats: u32) -> Arc<CommandDispatcher> {
        let settings = RemoteCommandSettings {
            package_id: PACKAGE.to_string(),
            locate_repeats: repeats,
            locate_interval_ms: 5,
        };
        Arc::new(CommandDispatcher::new(feedback, &settings))
    }

    #[test]
    fn actions_map_to_commands() {
        for command in RemoteCommand::ALL {
            let action = command.action(PACKAGE);
            assert_eq!(RemoteCommand::from_action(&action, PACKAGE), Some(command));
        }
        assert_eq!(
            RemoteCommand::PlaySound.action(PACKAGE),
            "com.ChuJiao.quest3_wireless_adb.PLAY_SOUND"
        );
        assert_eq!(RemoteCommand::from_action("com.other.PLAY_SOUND", PACKAGE), None);
        assert_eq!(
            RemoteCommand::from_action(&format!("{PACKAGE}.REBOOT"), PACKAGE),
            None
        );
        assert_eq!(RemoteCommand::parse_name("locate"), Some(RemoteCommand::FindDevice));
        assert_eq!(RemoteCommand::parse_name("PLAY-SOUND"), Some(RemoteCommand::PlaySound));
        assert_eq!(RemoteCommand::parse_name("dance"), None);
    }

    #[test]
    fn beep_decays_from_half_amplitude() {
        let samples = beep_samples(&Tone::default());
        assert_eq!(samples.len(), 22_050);
        assert_eq!(samples[0], 0.0);
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak <= 0.5 && peak > 0.45, "peak {peak}");
        let tail_peak = samples[samples.len() - 500..]
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(tail_peak < 0.02, "tail {tail_peak}");
    }

    #[test]
    fn dispatches_sound_vibrate_and_locate() {
        let feedback = Arc::new(RecordingFeedback::default());
        let dispatcher = dispatcher(Arc::clone(&feedback), 3);

        assert!(dispatcher.dispatch(RemoteCommand::PlaySound).is_none());
        assert_eq!(feedback.tones.lock().expect("lock").len(), 1);

        assert!(dispatcher.dispatch(RemoteCommand::Vibrate).is_none());
        {
            let pulses = feedback.pulses.lock().expect("lock");
            let hands: Vec<Hand> = pulses.iter().map(|(hand, _)| *hand).collect();
            assert_eq!(hands, vec![Hand::Right, Hand::Left]);
            assert!(pulses.iter().all(|(_, p)| p.amplitude == 1.0 && p.duration == Duration::from_secs(1)));
        }

        dispatcher
            .dispatch(RemoteCommand::FindDevice)
            .expect("locate thread")
            .join()
            .expect("join");
        assert_eq!(feedback.tones.lock().expect("lock").len(), 4);
        assert_eq!(feedback.pulses.lock().expect("lock").len(), 8);
    }

    #[test]
    fn listener_registers_once_and_reregisters_on_resume() {
        let feedback = Arc::new(RecordingFeedback::default());
        let bus = Arc::new(BroadcastBus::new());
        let listener = CommandListener::new(bus.clone(), dispatcher(Arc::clone(&feedback), 1), PACKAGE, "trace");

        listener.register().expect("register");
        listener.register().expect("register again");
        assert_eq!(bus.receiver_count(), 1);

        assert_eq!(bus.send(&RemoteCommand::PlaySound.action(PACKAGE)), 1);
        assert_eq!(feedback.tones.lock().expect("lock").len(), 1);
        assert_eq!(bus.send("com.other.PLAY_SOUND"), 0);

        listener.on_focus(false).expect("focus lost");
        assert!(listener.is_registered());
        listener.on_resume().expect("resume");
        assert_eq!(bus.receiver_count(), 1);
        assert_eq!(bus.send(&RemoteCommand::Vibrate.action(PACKAGE)), 1);
        assert_eq!(feedback.pulses.lock().expect("lock").len(), 2);

        listener.unregister();
        assert!(!listener.is_registered());
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn routed_locate_runs_to_completion_after_wait_idle() {
        let feedback = Arc::new(RecordingFeedback::default());
        let bus = Arc::new(BroadcastBus::new());
        let listener = CommandListener::new(bus.clone(), dispatcher(Arc::clone(&feedback), 5), PACKAGE, "trace");
        listener.register().expect("register");

        assert_eq!(bus.send(&RemoteCommand::FindDevice.action(PACKAGE)), 1);
        listener.wait_idle();
        assert_eq!(feedback.tones.lock().expect("lock").len(), 5);
        assert_eq!(feedback.pulses.lock().expect("lock").len(), 10);

        // Nothing left to join.
        listener.wait_idle();
    }

    #[test]
    fn unknown_actions_are_ignored() {
        let feedback = Arc::new(RecordingFeedback::default());
        let dispatcher = dispatcher(Arc::clone(&feedback), 1);
        assert_eq!(route_action(&dispatcher, PACKAGE, "android.intent.action.BOOT_COMPLETED"), None);
        assert_eq!(
            route_action(&dispatcher, PACKAGE, &RemoteCommand::PlaySound.action(PACKAGE)),
            Some(RemoteCommand::PlaySound)
        );
        assert_eq!(feedback.tones.lock().expect("lock").len(), 1);
        assert!(feedback.pulses.lock().expect("lock").is_empty());
    }
}
