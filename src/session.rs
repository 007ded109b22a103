//! One connected client and the virtual controller it drives.
//!
//! A session processes its connection's messages strictly in order on a single task.
//! Device feedback reaches it through its [`FeedbackBridge`], so `state`, `state_out`
//! and the observer list are only ever touched from that task.

use crate::bridge::FeedbackBridge;
use crate::connection::{Connection, Frame};
use crate::device::{self, Applied, Device};
use crate::protocol::{self, Command, Envelope};
use crate::virtual_controller::{ControllerFactory, Feedback, Mode};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type SessionId = u32;

pub const LARGE_MOTOR: &str = "large_motor";
pub const SMALL_MOTOR: &str = "small_motor";
pub const LED_NUMBER: &str = "led_number";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Closing,
    Closed,
}

/// Deep copy of a session's state handed to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub mode: Mode,
    pub state: BTreeMap<String, f32>,
    pub state_out: BTreeMap<String, f32>,
}

impl SessionSnapshot {
    /// Requested value of a control, 0 when never set
    pub fn value(&self, key: &str) -> f32 {
        self.state.get(key).copied().unwrap_or(0.0)
    }

    /// Last feedback value, 0 when none arrived yet
    pub fn feedback(&self, key: &str) -> f32 {
        self.state_out.get(key).copied().unwrap_or(0.0)
    }
}

/// Notified after every change of a session's state or feedback
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()>;
}

impl<F> StateObserver for F
where
    F: Fn(&SessionSnapshot) -> anyhow::Result<()> + Send + Sync,
{
    fn state_changed(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        self(snapshot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverKey(u64);

pub struct Session {
    id: SessionId,
    mode: Mode,
    phase: Phase,
    state: BTreeMap<String, f32>,
    state_out: BTreeMap<String, f32>,
    last_ordinal: HashMap<String, u64>,
    next_ordinal: u64,
    device: Option<Box<dyn Device>>,
    factory: Arc<dyn ControllerFactory>,
    feedback: FeedbackBridge,
    observers: Vec<(ObserverKey, Arc<dyn StateObserver>)>,
    next_observer: u64,
    connection: Box<dyn Connection>,
    disconnected: bool,
    cancel: CancellationToken,
    protocol_errors: u64,
}

impl Session {
    /// Build a session without a controller; call [`Session::start`] before running it
    pub fn new(
        id: SessionId,
        mode: Mode,
        factory: Arc<dyn ControllerFactory>,
        connection: Box<dyn Connection>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            mode,
            phase: Phase::Active,
            state: BTreeMap::new(),
            state_out: BTreeMap::new(),
            last_ordinal: HashMap::new(),
            next_ordinal: 1,
            device: None,
            factory,
            feedback: FeedbackBridge::new(),
            observers: Vec::new(),
            next_observer: 0,
            connection,
            disconnected: false,
            cancel,
            protocol_errors: 0,
        }
    }

    /// Create the virtual controller for the initial mode
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.create_device()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &BTreeMap<String, f32> {
        &self.state
    }

    pub fn state_out(&self) -> &BTreeMap<String, f32> {
        &self.state_out
    }

    pub fn last_ordinal(&self, key: &str) -> Option<u64> {
        self.last_ordinal.get(key).copied()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Commands dropped because they could not be parsed
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            mode: self.mode,
            state: self.state.clone(),
            state_out: self.state_out.clone(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn StateObserver>) -> ObserverKey {
        let key = ObserverKey(self.next_observer);
        self.next_observer += 1;
        self.observers.push((key, observer));
        key
    }

    pub fn remove_observer(&mut self, key: ObserverKey) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != key);
        self.observers.len() != before
    }

    /// Receive loop. Returns once the peer closes, the transport fails or the
    /// session is cancelled; the controller is released before returning.
    pub async fn run(&mut self) {
        log::info!("Session {} started in {} mode", self.id, self.mode);
        while self.phase == Phase::Active {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    log::info!("Session {} closing on server shutdown", self.id);
                    self.phase = Phase::Closing;
                    self.close(protocol::CLOSE_GOING_AWAY, protocol::SERVER_CLOSED_REASON)
                        .await;
                }
                frame = self.connection.recv() => match frame {
                    Frame::Text(text) => self.handle_message(&text).await,
                    Frame::Closed(code) => {
                        log::info!("Session {} connection closed with code {:?}", self.id, code);
                        self.disconnected = true;
                        self.phase = Phase::Closing;
                    }
                    Frame::Error(e) => {
                        log::error!("Session {} connection closed with error: {}", self.id, e);
                        self.disconnected = true;
                        self.phase = Phase::Closing;
                    }
                },
                Some(feedback) = self.feedback.recv() => self.handle_feedback(feedback).await,
            }
        }
        self.release_device();
    }

    /// Parse and apply every command line of one inbound message
    pub async fn handle_message(&mut self, message: &str) {
        if self.phase == Phase::Closed {
            log::debug!("Session {} is closed, ignoring {:?}", self.id, message);
            return;
        }
        log::debug!("Session {} > {}", self.id, message);
        for line in protocol::lines(message) {
            match protocol::parse_line(line) {
                Ok(envelope) => self.execute(envelope).await,
                Err(e) => {
                    self.protocol_errors += 1;
                    log::error!("Session {} dropped {:?}: {}", self.id, line, e);
                }
            }
        }
    }

    /// Record feedback from the controller and echo it to the client
    pub async fn handle_feedback(&mut self, feedback: Feedback) {
        if self.disconnected || self.phase != Phase::Active {
            return;
        }
        self.state_out
            .insert(LARGE_MOTOR.to_string(), feedback.large_motor);
        self.state_out
            .insert(SMALL_MOTOR.to_string(), feedback.small_motor);
        self.state_out
            .insert(LED_NUMBER.to_string(), f32::from(feedback.led_number));
        self.send(&protocol::format_feedback(
            feedback.large_motor,
            feedback.small_motor,
            feedback.led_number,
        ))
        .await;
        self.notify_observers();
    }

    /// Apply feedback already queued on the bridge without waiting for more
    pub async fn drain_feedback(&mut self) {
        while let Some(feedback) = self.feedback.try_recv() {
            self.handle_feedback(feedback).await;
        }
    }

    /// Close the transport from our side. Later sends are suppressed.
    pub async fn close(&mut self, code: u16, reason: &str) {
        if self.disconnected {
            return;
        }
        if let Err(e) = self.connection.close(code, reason).await {
            log::debug!("Session {} close failed: {}", self.id, e);
        }
        self.disconnected = true;
    }

    /// Final step of teardown; the session accepts nothing afterwards
    pub fn finish(&mut self) {
        self.release_device();
        self.disconnected = true;
        self.phase = Phase::Closed;
        log::info!("Session {} closed", self.id);
    }

    async fn execute(&mut self, envelope: Envelope) {
        let verb = envelope.command.verb();
        let changed = match envelope.command {
            Command::Set(pairs) => match self.assign_ordinal(envelope.ordinal) {
                Some(ordinal) => self.apply_set(pairs, ordinal),
                None => {
                    self.protocol_errors += 1;
                    log::error!(
                        "Session {} refused {} of {} control(s): ordinals exhausted, send reset or mode",
                        self.id,
                        verb,
                        pairs.len()
                    );
                    false
                }
            },
            Command::Reset => {
                self.reset();
                true
            }
            Command::Mode(mode) => {
                self.switch_mode(mode);
                true
            }
            Command::Log(text) => {
                log::info!(target: "padlink::client", "[{}] {}", self.id, text);
                false
            }
            Command::Ping(token) => {
                self.send(&protocol::format_pong(token.as_deref())).await;
                false
            }
        };
        if changed {
            self.notify_observers();
        }
    }

    // None once the ordinal space is used up; reset and mode start it over
    fn assign_ordinal(&mut self, explicit: Option<u64>) -> Option<u64> {
        let ordinal = explicit.unwrap_or(self.next_ordinal);
        let successor = ordinal.checked_add(1)?;
        self.next_ordinal = self.next_ordinal.max(successor);
        Some(ordinal)
    }

    fn is_fresh(&self, key: &str, ordinal: u64) -> bool {
        self.last_ordinal
            .get(key)
            .map_or(true, |&last| ordinal > last)
    }

    fn apply_set(&mut self, pairs: Vec<(String, f32)>, ordinal: u64) -> bool {
        // Freshness is judged against the state before this command, so a key
        // repeated within one command still applies in listed order
        let fresh: Vec<bool> = pairs
            .iter()
            .map(|(key, _)| self.is_fresh(key, ordinal))
            .collect();

        let Some(device) = self.device.as_mut() else {
            log::error!(
                "Session {} has no {} controller, dropping set",
                self.id,
                self.mode
            );
            return false;
        };

        let mut changed = false;
        for ((key, value), fresh) in pairs.into_iter().zip(fresh) {
            if !fresh {
                log::trace!(
                    "Session {} ignoring stale {} = {} (ordinal {})",
                    self.id,
                    key,
                    value,
                    ordinal
                );
                continue;
            }
            match device.apply(&key, value) {
                Applied::Ok => {
                    self.state.insert(key.clone(), value);
                    self.last_ordinal.insert(key, ordinal);
                    changed = true;
                }
                Applied::UnknownControl => {
                    let known: Vec<&str> = device::control_names(self.mode).collect();
                    log::warn!(
                        "Session {} unknown {} control {:?}: {} (known: {})",
                        self.id,
                        self.mode,
                        key,
                        value,
                        known.join(" ")
                    );
                }
            }
        }

        if changed {
            if let Err(e) = device.commit() {
                log::error!("Session {} failed to update controller: {:#}", self.id, e);
            }
        }
        changed
    }

    fn reset(&mut self) {
        self.state.clear();
        self.last_ordinal.clear();
        self.next_ordinal = 1;
        if let Some(device) = self.device.as_mut() {
            device.neutralize();
        }
    }

    fn switch_mode(&mut self, mode: Mode) {
        log::info!("Session {} switching {} -> {}", self.id, self.mode, mode);
        self.release_device();
        self.state.clear();
        self.last_ordinal.clear();
        self.next_ordinal = 1;
        self.mode = mode;
        if let Err(e) = self.create_device() {
            log::error!(
                "Session {} failed to create {} controller: {:#}",
                self.id,
                mode,
                e
            );
        }
    }

    fn create_device(&mut self) -> anyhow::Result<()> {
        let sender = self.feedback.next_sender();
        let device = device::create_device(self.factory.as_ref(), self.mode, sender)?;
        self.device = Some(device);
        Ok(())
    }

    // Dropping a device neutralizes it before the backend unplugs
    fn release_device(&mut self) {
        if let Some(device) = self.device.take() {
            log::debug!("Session {} releasing {} controller", self.id, device.mode());
            drop(device);
        }
    }

    async fn send(&mut self, text: &str) {
        if self.disconnected {
            return;
        }
        log::trace!("Session {} < {}", self.id, text);
        if let Err(e) = self.connection.send(text).await {
            log::warn!("Session {} send failed: {}", self.id, e);
            self.disconnected = true;
        }
    }

    fn notify_observers(&self) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for (key, observer) in &self.observers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                observer.state_changed(&snapshot)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("Session {} state observer failed: {:#}", self.id, e);
                }
                Err(_) => {
                    log::error!("Session {} state observer {:?} panicked", self.id, key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{self, ChannelPeer, Outbound};
    use crate::virtual_controller::{DpadDirection, MemoryFactory};
    use std::sync::Mutex;

    fn session(mode: Mode) -> (Session, ChannelPeer, MemoryFactory) {
        let factory = MemoryFactory::new();
        let (conn, peer) = connection::channel();
        let mut session = Session::new(
            0,
            mode,
            Arc::new(factory.clone()),
            Box::new(conn),
            CancellationToken::new(),
        );
        session.start().unwrap();
        (session, peer, factory)
    }

    fn value(session: &Session, key: &str) -> Option<f32> {
        session.state().get(key).copied()
    }

    fn recording_observer(session: &mut Session) -> Arc<Mutex<Vec<SessionSnapshot>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.add_observer(Arc::new(move |snapshot: &SessionSnapshot| -> anyhow::Result<()> {
            sink.lock().unwrap().push(snapshot.clone());
            Ok(())
        }));
        seen
    }

    #[tokio::test]
    async fn set_applies_pairs_and_commits_once() {
        let (mut session, _peer, factory) = session(Mode::Xbox);
        let handle = factory.last().unwrap();
        let commits = handle.commits();

        session.handle_message("set A 1 LSx 0.5 RT 0.25").await;

        assert_eq!(value(&session, "A"), Some(1.0));
        assert_eq!(value(&session, "LSx"), Some(0.5));
        assert_eq!(handle.commits(), commits + 1);
        let report = handle.report();
        assert!(report.buttons.a);
        assert!((report.left_stick_x - 0.5).abs() < f32::EPSILON);
        assert!((report.right_trigger - 0.25).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn repeated_key_in_one_command_applies_in_order() {
        let (mut session, _peer, factory) = session(Mode::Xbox);
        session.handle_message("set A 1 A 0").await;
        assert_eq!(value(&session, "A"), Some(0.0));
        assert!(!factory.last().unwrap().report().buttons.a);
    }

    #[tokio::test]
    async fn stale_ordinal_is_ignored() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("@5 set LT 0.5").await;
        session.handle_message("@3 set LT 0.9").await;
        session.handle_message("@5 set LT 0.1").await;
        assert_eq!(value(&session, "LT"), Some(0.5));
        assert_eq!(session.last_ordinal("LT"), Some(5));

        session.handle_message("@6 set LT 0.7").await;
        assert_eq!(value(&session, "LT"), Some(0.7));
    }

    #[tokio::test]
    async fn ordinals_are_tracked_per_key() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("@10 set A 1").await;
        session.handle_message("@4 set B 1").await;
        assert_eq!(value(&session, "A"), Some(1.0));
        assert_eq!(value(&session, "B"), Some(1.0));
    }

    #[tokio::test]
    async fn implicit_ordinals_continue_after_explicit_ones() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("@100 set A 1").await;
        session.handle_message("set A 0").await;
        assert_eq!(value(&session, "A"), Some(0.0));
        assert_eq!(session.last_ordinal("A"), Some(101));
    }

    #[tokio::test]
    async fn malformed_command_does_not_stop_the_message() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("set LS\nbogus 1\nset B 1").await;
        assert_eq!(value(&session, "LS"), None);
        assert_eq!(value(&session, "B"), Some(1.0));
        assert_eq!(session.protocol_errors(), 2);
        assert_eq!(session.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn unknown_control_is_not_recorded() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("set turbo 1 A 1").await;
        assert_eq!(value(&session, "turbo"), None);
        assert_eq!(session.last_ordinal("turbo"), None);
        assert_eq!(value(&session, "A"), Some(1.0));
    }

    #[tokio::test]
    async fn reset_clears_state_but_not_feedback() {
        let (mut session, _peer, factory) = session(Mode::Xbox);
        session.handle_message("@9 set A 1 LT 1").await;
        session.handle_feedback(Feedback::from_raw(255, 0, 1)).await;

        session.handle_message("reset").await;

        assert!(session.state().is_empty());
        assert_eq!(session.last_ordinal("A"), None);
        assert_eq!(session.state_out().get(LED_NUMBER), Some(&1.0));
        assert!(factory.last().unwrap().report().is_neutral());

        // ordinals restart from scratch for every key
        session.handle_message("@1 set A 1").await;
        assert_eq!(value(&session, "A"), Some(1.0));
    }

    #[tokio::test]
    async fn mode_switch_replaces_the_controller() {
        let (mut session, _peer, factory) = session(Mode::Ds4);
        session.handle_message("set X 1 up 1").await;
        let old = factory.last().unwrap();

        session.handle_message("mode xbox").await;

        assert_eq!(session.mode(), Mode::Xbox);
        assert!(session.state().is_empty());
        assert!(old.is_released());
        assert!(old.report().is_neutral());
        let new = factory.last().unwrap();
        assert_eq!(new.mode(), Mode::Xbox);
        assert!(!new.is_released());
        assert!(new.report().is_neutral());
        assert_eq!(factory.live().len(), 1);
    }

    #[tokio::test]
    async fn ds4_pad_through_protocol() {
        let (mut session, _peer, factory) = session(Mode::Ds4);
        session.handle_message("set up 1 right 1").await;
        assert_eq!(factory.last().unwrap().report().dpad, DpadDirection::NorthEast);
        session.handle_message("set up 0").await;
        assert_eq!(factory.last().unwrap().report().dpad, DpadDirection::East);
        session.handle_message("set right 0").await;
        assert_eq!(factory.last().unwrap().report().dpad, DpadDirection::Neutral);
    }

    #[tokio::test]
    async fn ping_replies_and_log_is_silent() {
        let (mut session, mut peer, _factory) = session(Mode::Xbox);
        let seen = recording_observer(&mut session);

        session.handle_message("log hello there\nping\nping abc").await;

        assert_eq!(peer.try_recv(), Some(Outbound::Text("pong".to_string())));
        assert_eq!(peer.try_recv(), Some(Outbound::Text("pong abc".to_string())));
        assert_eq!(peer.try_recv(), None);
        assert!(session.state().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn observers_get_snapshots_after_mutations() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        let seen = recording_observer(&mut session);

        session.handle_message("set A 1").await;
        session.handle_message("reset").await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!((seen[0].value("A") - 1.0).abs() < f32::EPSILON);
        assert!(seen[1].state.is_empty());
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.add_observer(Arc::new(|_: &SessionSnapshot| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("window went away"))
        }));
        let seen = recording_observer(&mut session);

        session.handle_message("set B 1").await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(value(&session, "B"), Some(1.0));
    }

    #[tokio::test]
    async fn panicking_observer_does_not_block_others() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.add_observer(Arc::new(|_: &SessionSnapshot| -> anyhow::Result<()> {
            panic!("observer bug")
        }));
        let seen = recording_observer(&mut session);

        session.handle_message("set B 1").await;
        session.handle_message("set X 1").await;

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(value(&session, "X"), Some(1.0));
        assert_eq!(session.phase(), Phase::Active);
    }

    #[tokio::test]
    async fn exhausted_ordinals_refuse_set_until_reset() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("@18446744073709551615 set B 1").await;
        assert_eq!(value(&session, "B"), None);
        assert_eq!(session.protocol_errors(), 1);

        // The last usable ordinal leaves nothing for an implicit follow-up
        session.handle_message("@18446744073709551614 set B 1").await;
        session.handle_message("set B 0").await;
        assert_eq!(value(&session, "B"), Some(1.0));
        assert_eq!(session.protocol_errors(), 2);

        session.handle_message("reset").await;
        session.handle_message("set A 1").await;
        session.handle_message("set A 0").await;
        assert_eq!(value(&session, "A"), Some(0.0));
        assert_eq!(session.last_ordinal("A"), Some(2));
    }

    #[tokio::test]
    async fn mode_switch_restarts_implicit_ordinals() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        session.handle_message("@18446744073709551614 set A 1").await;
        session.handle_message("mode ds4").await;
        session.handle_message("set A 1").await;
        assert_eq!(session.last_ordinal("A"), Some(1));
        session.handle_message("set A 0").await;
        assert_eq!(value(&session, "A"), Some(0.0));
    }

    #[tokio::test]
    async fn removed_observer_is_not_called() {
        let (mut session, _peer, _factory) = session(Mode::Xbox);
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let key = session.add_observer(Arc::new(move |_: &SessionSnapshot| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        assert!(session.remove_observer(key));
        assert!(!session.remove_observer(key));

        session.handle_message("set A 1").await;
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn feedback_updates_state_out_and_echoes() {
        let (mut session, mut peer, factory) = session(Mode::Xbox);
        let seen = recording_observer(&mut session);

        let handle = factory.last().unwrap();
        std::thread::spawn(move || handle.inject_feedback(Feedback::from_raw(255, 0, 2)))
            .join()
            .unwrap();
        session.drain_feedback().await;

        assert_eq!(session.state_out().get(LARGE_MOTOR), Some(&1.0));
        assert_eq!(session.state_out().get(SMALL_MOTOR), Some(&0.0));
        assert_eq!(session.state_out().get(LED_NUMBER), Some(&2.0));
        assert_eq!(
            peer.try_recv(),
            Some(Outbound::Text(
                "set large_motor 1 small_motor 0 led_number 2".to_string()
            ))
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(session.state().is_empty());
    }

    #[tokio::test]
    async fn feedback_from_replaced_controller_is_dropped() {
        let (mut session, mut peer, factory) = session(Mode::Xbox);
        let old = factory.last().unwrap();
        session.handle_message("mode ds4").await;

        old.inject_feedback(Feedback::from_raw(255, 255, 1));
        session.drain_feedback().await;

        assert!(session.state_out().is_empty());
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn feedback_after_disconnect_is_a_no_op() {
        let (mut session, mut peer, factory) = session(Mode::Xbox);
        session.close(1000, "bye").await;
        assert!(matches!(peer.try_recv(), Some(Outbound::Close { code: 1000, .. })));

        factory
            .last()
            .unwrap()
            .inject_feedback(Feedback::from_raw(255, 255, 1));
        session.drain_feedback().await;

        assert!(session.state_out().is_empty());
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn run_ends_on_peer_close_and_releases_controller() {
        let (mut session, peer, factory) = session(Mode::Ds4);
        peer.send("set A 1");
        peer.close(Some(1000));

        session.run().await;

        assert_eq!(value(&session, "A"), Some(1.0));
        assert_eq!(session.phase(), Phase::Closing);
        assert!(!session.has_device());
        assert!(factory.live().is_empty());

        session.finish();
        assert_eq!(session.phase(), Phase::Closed);
        session.handle_message("set B 1").await;
        assert_eq!(value(&session, "B"), None);
    }

    #[tokio::test]
    async fn run_delivers_feedback_between_commands() {
        let (mut session, mut peer, factory) = session(Mode::Xbox);
        let handle = factory.last().unwrap();

        let task = tokio::spawn(async move {
            session.run().await;
            session
        });

        handle.inject_feedback(Feedback::from_raw(0, 255, 3));
        assert_eq!(
            peer.recv().await,
            Some(Outbound::Text(
                "set large_motor 0 small_motor 1 led_number 3".to_string()
            ))
        );
        peer.close(None);

        let session = task.await.unwrap();
        assert_eq!(session.state_out().get(LED_NUMBER), Some(&3.0));
    }

    #[tokio::test]
    async fn cancel_closes_with_going_away() {
        let (mut session, mut peer, factory) = session(Mode::Xbox);
        let cancel = session.cancel.clone();
        cancel.cancel();

        session.run().await;

        assert_eq!(
            peer.try_recv(),
            Some(Outbound::Close {
                code: protocol::CLOSE_GOING_AWAY,
                reason: protocol::SERVER_CLOSED_REASON.to_string(),
            })
        );
        assert!(session.is_disconnected());
        assert!(factory.live().is_empty());
    }

    #[tokio::test]
    async fn transport_error_ends_the_loop() {
        let (mut session, peer, _factory) = session(Mode::Xbox);
        peer.fail(crate::connection::TransportError::WebSocket("reset by peer".to_string()));
        session.run().await;
        assert!(session.is_disconnected());
        assert_eq!(session.phase(), Phase::Closing);
    }
}
