//! Per-device connection state machine.
//!
//! Each peer device gets one `HfpStateMachine`. The machine is a plain
//! struct; all of its methods run on the service's dispatch context, so no
//! locking happens here. Actions push commands through the injected native
//! interface and mutate local state only; the service layer compares the
//! externally visible states around each action to decide what to notify.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use bt_common::time::Alarm;

use crate::bluetooth_hfp::ConnectionPolicy;
use crate::hfp::{AgIndicatorState, HfpAudioState, HfpConnectionState, HfpNativeInterface};
use crate::BDAddr;

/// Times a stuck audio teardown is retried before the whole connection is
/// dropped.
pub const MAX_RETRY_DISCONNECT_AUDIO: u32 = 3;

/// Internal state of one device's machine. The four audio states all imply
/// an established service-level connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileState {
    Disconnected,
    Connecting,
    Disconnecting,
    Connected,
    AudioConnecting,
    AudioOn,
    AudioDisconnecting,
}

/// Connection state as observers see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Audio state as observers see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the service should do about the device timer after a timeout was
/// handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMachineTimeoutActions {
    RetryDisconnectAudio,
    ForceDisconnect,
    Noop,
}

/// Externally visible connection record for one device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConnection {
    pub addr: BDAddr,
    pub connection_state: ConnectionState,
    pub audio_state: AudioState,
    /// When the device last entered Connecting; orders fallback selection.
    pub connecting_timestamp: Option<Instant>,
    pub connection_policy: ConnectionPolicy,
}

pub struct HfpStateMachine {
    addr: BDAddr,
    state: ProfileState,
    connecting_timestamp: Option<Instant>,
    audio_disconnect_retry: u32,
    speaker_volume: Option<u8>,
    mic_volume: Option<u8>,
    ag_indicator_mask: AgIndicatorState,
}

impl HfpStateMachine {
    pub fn new(addr: BDAddr) -> Self {
        HfpStateMachine {
            addr,
            state: ProfileState::Disconnected,
            connecting_timestamp: None,
            audio_disconnect_retry: 0,
            speaker_volume: None,
            mic_volume: None,
            ag_indicator_mask: AgIndicatorState::all(),
        }
    }

    pub fn state(&self) -> ProfileState {
        self.state
    }

    pub fn connecting_timestamp(&self) -> Option<Instant> {
        self.connecting_timestamp
    }

    /// Connection state kept in the device record and broadcast to
    /// observers. All audio states count as connected.
    pub fn connection_state(&self) -> ConnectionState {
        match self.state {
            ProfileState::Disconnected => ConnectionState::Disconnected,
            ProfileState::Connecting => ConnectionState::Connecting,
            ProfileState::Disconnecting => ConnectionState::Disconnecting,
            ProfileState::Connected
            | ProfileState::AudioConnecting
            | ProfileState::AudioOn
            | ProfileState::AudioDisconnecting => ConnectionState::Connected,
        }
    }

    /// Audio state kept in the device record.
    pub fn audio_state(&self) -> AudioState {
        match self.state {
            ProfileState::AudioConnecting => AudioState::Connecting,
            ProfileState::AudioOn => AudioState::Connected,
            ProfileState::AudioDisconnecting => AudioState::Disconnecting,
            _ => AudioState::Disconnected,
        }
    }

    /// Audio state as broadcast to observers. A teardown in flight still
    /// reports connected until the stack confirms, which keeps the retry
    /// loop silent and makes combined teardowns report one audio drop.
    pub fn broadcast_audio_state(&self) -> AudioState {
        match self.state {
            ProfileState::AudioDisconnecting => AudioState::Connected,
            _ => self.audio_state(),
        }
    }

    pub fn speaker_volume(&self) -> Option<u8> {
        self.speaker_volume
    }

    pub fn mic_volume(&self) -> Option<u8> {
        self.mic_volume
    }

    pub fn ag_indicator_mask(&self) -> AgIndicatorState {
        self.ag_indicator_mask
    }

    pub fn set_ag_indicator_mask(&mut self, mask: AgIndicatorState) {
        self.ag_indicator_mask = mask;
    }

    pub fn on_speaker_volume(&mut self, volume: u8) {
        self.speaker_volume = Some(volume);
    }

    pub fn on_mic_volume(&mut self, volume: u8) {
        self.mic_volume = Some(volume);
    }

    /// CONNECT command. Valid from Disconnected only.
    pub fn action_connect(&mut self, native: &mut dyn HfpNativeInterface) -> bool {
        match self.state {
            ProfileState::Disconnected => {
                info!("[{}]: connecting", self.addr);
                native.connect(self.addr);
                self.enter_connecting();
                true
            }
            _ => {
                warn!("[{}]: connect ignored in {:?}", self.addr, self.state);
                false
            }
        }
    }

    /// DISCONNECT command. Valid from Connected only; audio must come down
    /// first.
    pub fn action_disconnect(&mut self, native: &mut dyn HfpNativeInterface) -> bool {
        match self.state {
            ProfileState::Connected => {
                info!("[{}]: disconnecting", self.addr);
                native.disconnect(self.addr);
                self.state = ProfileState::Disconnecting;
                true
            }
            _ => {
                warn!("[{}]: disconnect ignored in {:?}", self.addr, self.state);
                false
            }
        }
    }

    /// CONNECT_AUDIO command. When SCO is managed by an external audio
    /// server the native call is skipped and only the state advances.
    pub fn action_connect_audio(
        &mut self,
        native: &mut dyn HfpNativeInterface,
        sco_managed_externally: bool,
    ) -> bool {
        match self.state {
            ProfileState::Connected => {
                info!("[{}]: connecting audio", self.addr);
                if !sco_managed_externally {
                    native.connect_audio(self.addr);
                }
                self.state = ProfileState::AudioConnecting;
                true
            }
            _ => {
                warn!("[{}]: connect audio ignored in {:?}", self.addr, self.state);
                false
            }
        }
    }

    /// DISCONNECT_AUDIO command. Valid while audio is up.
    pub fn action_disconnect_audio(&mut self, native: &mut dyn HfpNativeInterface) -> bool {
        match self.state {
            ProfileState::AudioOn => {
                info!("[{}]: disconnecting audio", self.addr);
                native.disconnect_audio(self.addr);
                self.state = ProfileState::AudioDisconnecting;
                true
            }
            _ => {
                warn!("[{}]: disconnect audio ignored in {:?}", self.addr, self.state);
                false
            }
        }
    }

    /// Connection state change reported by the stack.
    pub fn action_on_connection_state(&mut self, state: HfpConnectionState) {
        debug!("[{}]: stack connection state {:?} in {:?}", self.addr, state, self.state);
        match (self.state, state) {
            (ProfileState::Disconnected, HfpConnectionState::Connecting)
            | (ProfileState::Disconnected, HfpConnectionState::Connected) => {
                self.enter_connecting();
            }
            (ProfileState::Disconnected, HfpConnectionState::SlcConnected) => {
                // Never saw the setup events; accept the connection anyway.
                warn!("[{}]: service-level connection without setup", self.addr);
                self.enter_connecting();
                self.enter_connected();
            }
            (ProfileState::Disconnected, _) => {}

            (ProfileState::Connecting, HfpConnectionState::SlcConnected) => {
                self.enter_connected();
            }
            (ProfileState::Connecting, HfpConnectionState::Disconnected) => {
                self.enter_disconnected();
            }
            (ProfileState::Connecting, HfpConnectionState::Disconnecting) => {
                warn!("[{}]: ignoring premature disconnecting", self.addr);
            }
            (ProfileState::Connecting, _) => {}

            (ProfileState::Disconnecting, HfpConnectionState::Disconnected) => {
                self.enter_disconnected();
            }
            (ProfileState::Disconnecting, HfpConnectionState::SlcConnected) => {
                // The peer re-established before teardown finished.
                self.enter_connected();
            }
            (ProfileState::Disconnecting, _) => {}

            // Connection-level teardown is accepted in every connected
            // state; an in-flight audio path is reported down first by the
            // service layer.
            (
                ProfileState::Connected
                | ProfileState::AudioConnecting
                | ProfileState::AudioOn
                | ProfileState::AudioDisconnecting,
                HfpConnectionState::Disconnecting,
            ) => {
                self.state = ProfileState::Disconnecting;
            }
            (
                ProfileState::Connected
                | ProfileState::AudioConnecting
                | ProfileState::AudioOn
                | ProfileState::AudioDisconnecting,
                HfpConnectionState::Disconnected,
            ) => {
                self.enter_disconnected();
            }
            (ProfileState::Connected, _)
            | (ProfileState::AudioConnecting, _)
            | (ProfileState::AudioOn, _)
            | (ProfileState::AudioDisconnecting, _) => {}
        }
    }

    /// Audio state change reported by the stack.
    pub fn action_on_audio_state(
        &mut self,
        state: HfpAudioState,
        native: &mut dyn HfpNativeInterface,
    ) {
        debug!("[{}]: stack audio state {:?} in {:?}", self.addr, state, self.state);
        match (self.state, state) {
            (ProfileState::Connected, HfpAudioState::Connecting) => {
                self.state = ProfileState::AudioConnecting;
            }
            (ProfileState::Connected, HfpAudioState::Connected) => {
                self.enter_audio_on(native);
            }
            (ProfileState::AudioConnecting, HfpAudioState::Connected) => {
                self.enter_audio_on(native);
            }
            (ProfileState::AudioConnecting, HfpAudioState::Disconnected) => {
                self.state = ProfileState::Connected;
            }
            (ProfileState::AudioOn, HfpAudioState::Disconnecting) => {
                self.state = ProfileState::AudioDisconnecting;
            }
            (ProfileState::AudioOn, HfpAudioState::Disconnected) => {
                self.state = ProfileState::Connected;
            }
            (ProfileState::AudioDisconnecting, HfpAudioState::Disconnected) => {
                self.state = ProfileState::Connected;
            }
            (ProfileState::AudioDisconnecting, HfpAudioState::Connected) => {
                // Teardown failed; audio is still up.
                self.enter_audio_on(native);
            }
            _ => {
                warn!("[{}]: audio state {:?} ignored in {:?}", self.addr, state, self.state);
            }
        }
    }

    /// The pending-transition timer fired. Returns what the service should
    /// do about the timer afterwards.
    pub fn action_on_command_timeout(
        &mut self,
        native: &mut dyn HfpNativeInterface,
    ) -> StateMachineTimeoutActions {
        match self.state {
            ProfileState::Connecting => {
                warn!("[{}]: connect timed out", self.addr);
                self.enter_disconnected();
                StateMachineTimeoutActions::Noop
            }
            ProfileState::Disconnecting => {
                warn!("[{}]: disconnect timed out", self.addr);
                self.enter_disconnected();
                StateMachineTimeoutActions::Noop
            }
            ProfileState::AudioConnecting => {
                warn!("[{}]: audio connect timed out", self.addr);
                self.state = ProfileState::Connected;
                StateMachineTimeoutActions::Noop
            }
            ProfileState::AudioDisconnecting => {
                if self.audio_disconnect_retry < MAX_RETRY_DISCONNECT_AUDIO {
                    self.audio_disconnect_retry += 1;
                    warn!(
                        "[{}]: audio disconnect timed out, retry {}",
                        self.addr, self.audio_disconnect_retry
                    );
                    native.disconnect_audio(self.addr);
                    StateMachineTimeoutActions::RetryDisconnectAudio
                } else {
                    warn!("[{}]: audio teardown stuck, dropping the connection", self.addr);
                    native.disconnect(self.addr);
                    self.state = ProfileState::Disconnecting;
                    StateMachineTimeoutActions::ForceDisconnect
                }
            }
            _ => {
                // Stale timer, the device already settled.
                StateMachineTimeoutActions::Noop
            }
        }
    }

    fn enter_connecting(&mut self) {
        self.state = ProfileState::Connecting;
        self.connecting_timestamp = Some(Instant::now());
    }

    fn enter_connected(&mut self) {
        self.state = ProfileState::Connected;
        self.audio_disconnect_retry = 0;
    }

    fn enter_audio_on(&mut self, native: &mut dyn HfpNativeInterface) {
        self.state = ProfileState::AudioOn;
        // Re-apply the gain the headset last asked for.
        if let Some(volume) = self.speaker_volume {
            native.set_volume(self.addr, volume);
        }
    }

    fn enter_disconnected(&mut self) {
        self.state = ProfileState::Disconnected;
        self.connecting_timestamp = None;
        self.audio_disconnect_retry = 0;
    }
}

/// Tracks pending-transition deadlines for all devices over one alarm.
pub struct CommandTimeout {
    pub waker: Arc<Alarm>,
    /// Next time to wake. Reset when the alarm is armed.
    expired: bool,
    /// Addresses of devices with pending deadlines.
    per_device_timeout: HashMap<BDAddr, Instant>,
    /// Timeout applied to every pending transition.
    duration: Duration,
}

impl CommandTimeout {
    pub fn new(duration: Duration) -> Self {
        CommandTimeout {
            waker: Arc::new(Alarm::new()),
            expired: true,
            per_device_timeout: HashMap::new(),
            duration,
        }
    }

    /// Arms or re-arms the deadline for a device.
    pub fn set_next(&mut self, addr: BDAddr) {
        let wake = Instant::now() + self.duration;
        self.per_device_timeout.entry(addr).and_modify(|v| *v = wake).or_insert(wake);
        if self.expired {
            self.waker.reset(self.duration);
            self.expired = false;
        }
    }

    /// Cancels the deadline for a device.
    pub fn cancel(&mut self, addr: &BDAddr) {
        self.per_device_timeout.remove(addr);
    }

    /// Collects devices whose deadline passed and re-arms the alarm for the
    /// earliest remaining one.
    pub fn expire(&mut self) -> Vec<BDAddr> {
        let now = Instant::now();
        let completed: Vec<BDAddr> = self
            .per_device_timeout
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &completed {
            self.per_device_timeout.remove(addr);
        }
        match self.per_device_timeout.values().min() {
            Some(deadline) => self.waker.reset(*deadline - now),
            None => {
                self.waker.cancel();
                self.expired = true;
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfp::{CallState, CmeError, PhoneState};
    use std::collections::VecDeque;

    #[derive(Debug, PartialEq)]
    enum ExecutedCommand {
        Connect,
        Disconnect,
        ConnectAudio,
        DisconnectAudio,
        SetVolume(u8),
    }

    struct MockNative {
        last_command: VecDeque<ExecutedCommand>,
    }

    impl MockNative {
        fn new() -> Self {
            MockNative { last_command: VecDeque::new() }
        }

        fn expect_connect(&mut self) {
            self.last_command.push_back(ExecutedCommand::Connect);
        }

        fn expect_disconnect(&mut self) {
            self.last_command.push_back(ExecutedCommand::Disconnect);
        }

        fn expect_connect_audio(&mut self) {
            self.last_command.push_back(ExecutedCommand::ConnectAudio);
        }

        fn expect_disconnect_audio(&mut self) {
            self.last_command.push_back(ExecutedCommand::DisconnectAudio);
        }

        fn expect_set_volume(&mut self, volume: u8) {
            self.last_command.push_back(ExecutedCommand::SetVolume(volume));
        }

        fn executed(&mut self, actual: ExecutedCommand) {
            match self.last_command.pop_front() {
                Some(expected) => assert_eq!(expected, actual),
                None => panic!("unexpected native call: {:?}", actual),
            }
        }
    }

    impl HfpNativeInterface for MockNative {
        fn connect(&mut self, _addr: BDAddr) -> bool {
            self.executed(ExecutedCommand::Connect);
            true
        }
        fn disconnect(&mut self, _addr: BDAddr) -> bool {
            self.executed(ExecutedCommand::Disconnect);
            true
        }
        fn connect_audio(&mut self, _addr: BDAddr) -> bool {
            self.executed(ExecutedCommand::ConnectAudio);
            true
        }
        fn disconnect_audio(&mut self, _addr: BDAddr) -> bool {
            self.executed(ExecutedCommand::DisconnectAudio);
            true
        }
        fn set_active_device(&mut self, _addr: Option<BDAddr>) -> bool {
            panic!("unexpected set_active_device");
        }
        fn set_volume(&mut self, _addr: BDAddr, volume: u8) -> bool {
            self.executed(ExecutedCommand::SetVolume(volume));
            true
        }
        fn send_bsir(&mut self, _addr: BDAddr, _enabled: bool) -> bool {
            panic!("unexpected send_bsir");
        }
        fn phone_state_change(&mut self, _addr: BDAddr, _state: &PhoneState, _number: &str) -> bool {
            panic!("unexpected phone_state_change");
        }
        fn at_response_ok(&mut self, _addr: BDAddr) -> bool {
            panic!("unexpected at_response_ok");
        }
        fn at_response_error(&mut self, _addr: BDAddr, _cme: CmeError) -> bool {
            panic!("unexpected at_response_error");
        }
        fn at_response_string(&mut self, _addr: BDAddr, _response: &str) -> bool {
            panic!("unexpected at_response_string");
        }
        fn clcc_response(
            &mut self,
            _addr: BDAddr,
            _index: i32,
            _dir_incoming: bool,
            _state: CallState,
            _mpty: bool,
            _number: &str,
        ) -> bool {
            panic!("unexpected clcc_response");
        }
        fn cind_response(
            &mut self,
            _addr: BDAddr,
            _network_available: bool,
            _num_active: i32,
            _num_held: i32,
            _call_setup_state: CallState,
            _signal: i32,
            _roam: bool,
            _battery: i32,
        ) -> bool {
            panic!("unexpected cind_response");
        }
        fn cops_response(&mut self, _addr: BDAddr, _operator: &str) -> bool {
            panic!("unexpected cops_response");
        }
    }

    impl Drop for MockNative {
        fn drop(&mut self) {
            assert_eq!(self.last_command.len(), 0);
        }
    }

    fn addr() -> BDAddr {
        BDAddr::from_string("00:11:22:33:44:55").unwrap()
    }

    fn connected_machine(native: &mut MockNative) -> HfpStateMachine {
        let mut machine = HfpStateMachine::new(addr());
        native.expect_connect();
        machine.action_connect(native);
        machine.action_on_connection_state(HfpConnectionState::SlcConnected);
        assert_eq!(machine.state(), ProfileState::Connected);
        machine
    }

    fn audio_on_machine(native: &mut MockNative) -> HfpStateMachine {
        let mut machine = connected_machine(native);
        native.expect_connect_audio();
        machine.action_connect_audio(native, false);
        machine.action_on_audio_state(HfpAudioState::Connected, native);
        assert_eq!(machine.state(), ProfileState::AudioOn);
        machine
    }

    #[test]
    fn connect_starts_connecting() {
        let mut native = MockNative::new();
        let mut machine = HfpStateMachine::new(addr());
        native.expect_connect();
        assert!(machine.action_connect(&mut native));
        assert_eq!(machine.state(), ProfileState::Connecting);
        assert!(machine.connecting_timestamp().is_some());
        // A second connect has nothing to do.
        assert!(!machine.action_connect(&mut native));
    }

    #[test]
    fn inbound_setup_reaches_connected() {
        let mut machine = HfpStateMachine::new(addr());
        machine.action_on_connection_state(HfpConnectionState::Connecting);
        assert_eq!(machine.state(), ProfileState::Connecting);
        // Setup progressing is not a transition.
        machine.action_on_connection_state(HfpConnectionState::Connected);
        assert_eq!(machine.state(), ProfileState::Connecting);
        machine.action_on_connection_state(HfpConnectionState::SlcConnected);
        assert_eq!(machine.state(), ProfileState::Connected);
    }

    #[test]
    fn connecting_peer_rejects() {
        let mut native = MockNative::new();
        let mut machine = HfpStateMachine::new(addr());
        native.expect_connect();
        machine.action_connect(&mut native);
        machine.action_on_connection_state(HfpConnectionState::Disconnected);
        assert_eq!(machine.state(), ProfileState::Disconnected);
        assert_eq!(machine.connecting_timestamp(), None);
    }

    #[test]
    fn premature_disconnecting_is_ignored() {
        let mut native = MockNative::new();
        let mut machine = HfpStateMachine::new(addr());
        native.expect_connect();
        machine.action_connect(&mut native);
        machine.action_on_connection_state(HfpConnectionState::Disconnecting);
        assert_eq!(machine.state(), ProfileState::Connecting);
    }

    #[test]
    fn disconnect_round_trip() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        native.expect_disconnect();
        assert!(machine.action_disconnect(&mut native));
        assert_eq!(machine.state(), ProfileState::Disconnecting);
        machine.action_on_connection_state(HfpConnectionState::Disconnected);
        assert_eq!(machine.state(), ProfileState::Disconnected);
    }

    #[test]
    fn disconnecting_peer_wins_race() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        native.expect_disconnect();
        machine.action_disconnect(&mut native);
        machine.action_on_connection_state(HfpConnectionState::SlcConnected);
        assert_eq!(machine.state(), ProfileState::Connected);
    }

    #[test]
    fn audio_setup_round_trip() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        native.expect_connect_audio();
        assert!(machine.action_connect_audio(&mut native, false));
        assert_eq!(machine.state(), ProfileState::AudioConnecting);
        assert_eq!(machine.audio_state(), AudioState::Connecting);
        machine.action_on_audio_state(HfpAudioState::Connected, &mut native);
        assert_eq!(machine.state(), ProfileState::AudioOn);
        assert_eq!(machine.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn audio_connects_directly_from_connected() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        machine.action_on_audio_state(HfpAudioState::Connected, &mut native);
        assert_eq!(machine.state(), ProfileState::AudioOn);
    }

    #[test]
    fn audio_setup_skips_native_when_sco_managed_externally() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        assert!(machine.action_connect_audio(&mut native, true));
        assert_eq!(machine.state(), ProfileState::AudioConnecting);
    }

    #[test]
    fn audio_failure_falls_back_to_connected() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        native.expect_connect_audio();
        machine.action_connect_audio(&mut native, false);
        machine.action_on_audio_state(HfpAudioState::Disconnected, &mut native);
        assert_eq!(machine.state(), ProfileState::Connected);
    }

    #[test]
    fn speaker_volume_reapplied_when_audio_comes_up() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        machine.on_speaker_volume(11);
        native.expect_connect_audio();
        machine.action_connect_audio(&mut native, false);
        native.expect_set_volume(11);
        machine.action_on_audio_state(HfpAudioState::Connected, &mut native);
        assert_eq!(machine.state(), ProfileState::AudioOn);
    }

    #[test]
    fn audio_teardown_round_trip() {
        let mut native = MockNative::new();
        let mut machine = audio_on_machine(&mut native);
        native.expect_disconnect_audio();
        assert!(machine.action_disconnect_audio(&mut native));
        assert_eq!(machine.state(), ProfileState::AudioDisconnecting);
        // Still connected on both external channels while tearing down.
        assert_eq!(machine.connection_state(), ConnectionState::Connected);
        assert_eq!(machine.broadcast_audio_state(), AudioState::Connected);
        assert_eq!(machine.audio_state(), AudioState::Disconnecting);
        machine.action_on_audio_state(HfpAudioState::Disconnected, &mut native);
        assert_eq!(machine.state(), ProfileState::Connected);
    }

    #[test]
    fn audio_teardown_timeout_retries_then_drops_connection() {
        let mut native = MockNative::new();
        let mut machine = audio_on_machine(&mut native);
        native.expect_disconnect_audio();
        machine.action_disconnect_audio(&mut native);

        for _ in 0..MAX_RETRY_DISCONNECT_AUDIO {
            native.expect_disconnect_audio();
            assert_eq!(
                machine.action_on_command_timeout(&mut native),
                StateMachineTimeoutActions::RetryDisconnectAudio
            );
            assert_eq!(machine.state(), ProfileState::AudioDisconnecting);
        }

        native.expect_disconnect();
        assert_eq!(
            machine.action_on_command_timeout(&mut native),
            StateMachineTimeoutActions::ForceDisconnect
        );
        assert_eq!(machine.state(), ProfileState::Disconnecting);
        machine.action_on_connection_state(HfpConnectionState::Disconnected);
        assert_eq!(machine.state(), ProfileState::Disconnected);
    }

    #[test]
    fn retry_budget_resets_on_reconnect() {
        let mut native = MockNative::new();
        let mut machine = audio_on_machine(&mut native);
        native.expect_disconnect_audio();
        machine.action_disconnect_audio(&mut native);
        native.expect_disconnect_audio();
        machine.action_on_command_timeout(&mut native);
        // Stack confirms, budget must reset through Connected.
        machine.action_on_audio_state(HfpAudioState::Disconnected, &mut native);
        assert_eq!(machine.state(), ProfileState::Connected);
        assert_eq!(machine.audio_disconnect_retry, 0);
    }

    #[test]
    fn connect_timeout_returns_to_disconnected() {
        let mut native = MockNative::new();
        let mut machine = HfpStateMachine::new(addr());
        native.expect_connect();
        machine.action_connect(&mut native);
        assert_eq!(
            machine.action_on_command_timeout(&mut native),
            StateMachineTimeoutActions::Noop
        );
        assert_eq!(machine.state(), ProfileState::Disconnected);
    }

    #[test]
    fn audio_connect_timeout_returns_to_connected() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        native.expect_connect_audio();
        machine.action_connect_audio(&mut native, false);
        assert_eq!(
            machine.action_on_command_timeout(&mut native),
            StateMachineTimeoutActions::Noop
        );
        assert_eq!(machine.state(), ProfileState::Connected);
    }

    #[test]
    fn stack_disconnect_while_audio_up() {
        let mut native = MockNative::new();
        let mut machine = audio_on_machine(&mut native);
        assert_eq!(machine.broadcast_audio_state(), AudioState::Connected);
        machine.action_on_connection_state(HfpConnectionState::Disconnected);
        assert_eq!(machine.state(), ProfileState::Disconnected);
        assert_eq!(machine.broadcast_audio_state(), AudioState::Disconnected);
        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_timer_in_stable_state_is_noop() {
        let mut native = MockNative::new();
        let mut machine = connected_machine(&mut native);
        assert_eq!(
            machine.action_on_command_timeout(&mut native),
            StateMachineTimeoutActions::Noop
        );
        assert_eq!(machine.state(), ProfileState::Connected);
    }

    #[test]
    fn command_timeout_expires_due_devices() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut ct = CommandTimeout::new(Duration::from_millis(20));
            let a = BDAddr::from_string("00:00:00:00:00:01").unwrap();
            let b = BDAddr::from_string("00:00:00:00:00:02").unwrap();
            ct.set_next(a);
            ct.set_next(b);
            ct.cancel(&b);
            let waker = ct.waker.clone();
            waker.expired().await;
            assert_eq!(ct.expire(), vec![a]);
            assert!(ct.per_device_timeout.is_empty());
        });
    }

    #[test]
    fn command_timeout_rearms_for_remaining_devices() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut ct = CommandTimeout::new(Duration::from_millis(20));
            let a = BDAddr::from_string("00:00:00:00:00:01").unwrap();
            let b = BDAddr::from_string("00:00:00:00:00:02").unwrap();
            ct.set_next(a);
            tokio::time::sleep(Duration::from_millis(10)).await;
            ct.set_next(b);
            let waker = ct.waker.clone();
            waker.expired().await;
            assert_eq!(ct.expire(), vec![a]);
            // The alarm was re-armed for the second deadline.
            waker.expired().await;
            assert_eq!(ct.expire(), vec![b]);
        });
    }
}
