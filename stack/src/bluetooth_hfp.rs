//! HFP audio gateway service.
//!
//! Owns one state machine per peer device, serializes every command and
//! native event onto the dispatch queue, and tracks the cross-device pieces
//! the machines cannot see on their own: which device is active, silence
//! mode, aggregate phone state and the AT command surface.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;
use tokio::sync::mpsc::Sender;

use bt_utils::at_command_parser::{
    normalize_unknown_at, parse_at_command_data, AtCommand, AtCommandDataType,
};
use bt_utils::cod::is_cod_watch;

use crate::config_util::HfpServiceConfig;
use crate::hfp::{
    AgIndicatorState, CallHoldCommand, CallInfo, CallState, CmeError, HfpAudioState,
    HfpConnectionState, HfpNativeInterface, HfpStackEvent, HfpStackEventDispatcher, PhoneState,
};
use crate::phonebook::{toa_from_number, AtPhonebook, PhonebookQuery};
use crate::state_machine::{
    AudioState, CommandTimeout, ConnectionState, DeviceConnection, HfpStateMachine, ProfileState,
    StateMachineTimeoutActions,
};
use crate::uuid::{Profile, Uuid128Bit, UuidHelper};
use crate::{BDAddr, Message};

const MANUFACTURER_NAME: &str = "hfpstack";
const MODEL_NAME: &str = "hfpstack";
const SERIAL_NUMBER: &str = "0";
/// Reply to a two-argument AT+XAPL feature negotiation; announces battery
/// reporting support the way an iPhone would.
const XAPL_RESPONSE: &str = "+XAPL=iPhone,2";

/// Whether the profile may be connected for a device.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq)]
#[repr(u32)]
pub enum ConnectionPolicy {
    Unknown = 0,
    Forbidden,
    Allowed,
}

impl From<u32> for ConnectionPolicy {
    fn from(item: u32) -> Self {
        ConnectionPolicy::from_u32(item).unwrap()
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq)]
#[repr(u32)]
pub enum BondState {
    NotBonded = 0,
    Bonding,
    Bonded,
}

impl From<u32> for BondState {
    fn from(item: u32) -> Self {
        BondState::from_u32(item).unwrap()
    }
}

/// Result of an audio command, reported synchronously at posting time.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    ErrorProfileNotConnected,
    ErrorNotActiveDevice,
    ErrorAudioDeviceAlreadyDisconnected,
}

/// Profile command accepted by the API and executed on the dispatch queue.
#[derive(Clone, Copy, Debug)]
pub enum HfpCommand {
    Connect(BDAddr),
    Disconnect(BDAddr),
    ConnectAudio(BDAddr),
    DisconnectAudio(BDAddr),
}

/// Persisted per-device profile policy.
pub trait ConnectionPolicyStore {
    fn get_profile_connection_policy(&self, addr: BDAddr) -> ConnectionPolicy;
    /// Returns false when the policy could not be persisted.
    fn set_profile_connection_policy(&mut self, addr: BDAddr, policy: ConnectionPolicy) -> bool;
}

/// Adapter queries consulted before a connection attempt.
pub trait AdapterInterface {
    fn get_bond_state(&self, addr: BDAddr) -> BondState;
    fn get_remote_uuids(&self, addr: BDAddr) -> Vec<Uuid128Bit>;
    fn get_class_of_device(&self, addr: BDAddr) -> u32;
}

/// Telephony state and call control, backed by the platform dialer.
pub trait TelephonyInterface {
    fn is_ringing(&self) -> bool;
    fn is_in_call(&self) -> bool;
    fn answer_call(&mut self) -> bool;
    fn hangup_call(&mut self) -> bool;
    fn dial_outgoing_call(&mut self, number: &str) -> bool;
    fn process_call_hold(&mut self, chld: CallHoldCommand) -> bool;
    fn current_calls(&self) -> Vec<CallInfo>;
    fn subscriber_number(&self) -> Option<String>;
    fn network_operator(&self) -> Option<String>;
    fn network_available(&self) -> bool;
    fn signal_strength(&self) -> i32;
    fn is_roaming(&self) -> bool;
    fn battery_level(&self) -> i32;
}

/// Observer interface for profile state. All notifications run on the
/// dispatch context, after the state they describe is already applied.
pub trait IBluetoothHfpCallback {
    fn on_connection_state_changed(
        &self,
        addr: BDAddr,
        prev_state: ConnectionState,
        state: ConnectionState,
    );
    fn on_audio_state_changed(&self, addr: BDAddr, prev_state: AudioState, state: AudioState);
    fn on_active_device_changed(&self, addr: Option<BDAddr>);
    fn on_silence_mode_changed(&self, addr: BDAddr, silenced: bool);
    fn on_speaker_volume_changed(&self, addr: BDAddr, volume: u8);
    fn on_battery_level_changed(&self, addr: BDAddr, level: u8);
}

/// Public service API. Commands return after gating and posting; the
/// resulting transitions are reported through registered callbacks.
pub trait IBluetoothHfp {
    fn register_callback(&mut self, callback: Box<dyn IBluetoothHfpCallback + Send>) -> u32;
    fn unregister_callback(&mut self, callback_id: u32) -> bool;

    /// Initiates a service level connection. False when policy, bond state,
    /// UUIDs, the connection registry or the device cap refuse it.
    fn connect(&mut self, addr: BDAddr) -> bool;
    /// Tears down the service level connection, audio included.
    fn disconnect(&mut self, addr: BDAddr) -> bool;

    /// Brings up SCO audio towards the active device.
    fn connect_audio(&mut self, addr: BDAddr) -> StatusCode;
    fn disconnect_audio(&mut self, addr: BDAddr) -> StatusCode;

    /// Selects which device call audio is routed to. `None` clears.
    fn set_active_device(&mut self, addr: Option<BDAddr>) -> bool;
    fn get_active_device(&self) -> Option<BDAddr>;

    /// Marks a device as silenced. Silencing the active device hands the
    /// active role to a fallback until the device is unsilenced.
    fn set_silence_mode(&mut self, addr: BDAddr, silence: bool) -> bool;
    fn get_silence_mode(&self, addr: BDAddr) -> bool;

    fn get_connection_state(&self, addr: BDAddr) -> ConnectionState;
    fn get_audio_state(&self, addr: BDAddr) -> AudioState;
    fn get_connected_devices(&self) -> Vec<BDAddr>;
    fn get_devices_matching_connection_states(&self, states: &[ConnectionState]) -> Vec<BDAddr>;
    /// Devices eligible to take over the active role: connected or
    /// connecting, minus the active device and watch-class devices.
    fn get_fallback_candidates(&self) -> Vec<BDAddr>;
    fn get_device(&self, addr: BDAddr) -> Option<DeviceConnection>;

    /// Persists the policy and connects or disconnects accordingly.
    fn set_connection_policy(&mut self, addr: BDAddr, policy: ConnectionPolicy) -> bool;
    fn get_connection_policy(&self, addr: BDAddr) -> ConnectionPolicy;

    /// Synthesizes an outgoing call so SCO can carry non-call audio.
    fn start_sco_using_virtual_voice_call(&mut self) -> bool;
    fn stop_sco_using_virtual_voice_call(&mut self) -> bool;

    /// Pushes the aggregate call state to every connected device.
    fn phone_state_changed(&mut self, state: PhoneState, number: String);

    /// Controls whether audio may be routed to headsets during calls.
    fn set_audio_route_allowed(&mut self, allowed: bool);
    fn get_audio_route_allowed(&self) -> bool;
}

pub struct BluetoothHfp {
    machines: HashMap<BDAddr, HfpStateMachine>,
    active_device: Option<BDAddr>,
    silenced: HashSet<BDAddr>,
    /// Device that held the active role when it was silenced; restored on
    /// unsilence, dropped on disconnect.
    silenced_active: Option<BDAddr>,
    audio_route_allowed: bool,
    phone_state: PhoneState,
    virtual_call_active: bool,
    config: HfpServiceConfig,
    phonebook: AtPhonebook,
    native: Box<dyn HfpNativeInterface + Send>,
    policy_store: Box<dyn ConnectionPolicyStore + Send>,
    adapter: Box<dyn AdapterInterface + Send>,
    telephony: Box<dyn TelephonyInterface + Send>,
    callbacks: Vec<(u32, Box<dyn IBluetoothHfpCallback + Send>)>,
    callback_last_id: u32,
    cmd_timeout: Arc<Mutex<CommandTimeout>>,
    tx: Sender<Message>,
}

impl BluetoothHfp {
    pub fn new(
        tx: Sender<Message>,
        config: HfpServiceConfig,
        native: Box<dyn HfpNativeInterface + Send>,
        policy_store: Box<dyn ConnectionPolicyStore + Send>,
        adapter: Box<dyn AdapterInterface + Send>,
        telephony: Box<dyn TelephonyInterface + Send>,
        phonebook: Box<dyn PhonebookQuery + Send>,
    ) -> BluetoothHfp {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        BluetoothHfp {
            machines: HashMap::new(),
            active_device: None,
            silenced: HashSet::new(),
            silenced_active: None,
            audio_route_allowed: config.audio_route_allowed,
            phone_state: PhoneState::default(),
            virtual_call_active: false,
            config,
            phonebook: AtPhonebook::new(phonebook),
            native,
            policy_store,
            adapter,
            telephony,
            callbacks: Vec::new(),
            callback_last_id: 0,
            cmd_timeout: Arc::new(Mutex::new(CommandTimeout::new(connect_timeout))),
            tx,
        }
    }

    /// Builds the dispatcher handed to the native stack; events it emits are
    /// posted to the dispatch queue.
    pub fn create_event_dispatcher(tx: Sender<Message>) -> HfpStackEventDispatcher {
        HfpStackEventDispatcher {
            dispatch: Box::new(move |ev| {
                let txl = tx.clone();
                tokio::spawn(async move {
                    let _ = txl.send(Message::Hfp(ev)).await;
                });
            }),
        }
    }

    /// Forwards expirations of the per-device transition timer onto the
    /// dispatch queue. Must be called once, from the dispatch context.
    pub fn spawn_timeout_listener(&self) {
        let ct = self.cmd_timeout.clone();
        let txl = self.tx.clone();
        tokio::spawn(async move {
            let timer = ct.lock().unwrap().waker.clone();
            loop {
                timer.expired().await;
                let due = ct.lock().unwrap().expire();
                for addr in due {
                    let _ = txl.send(Message::CommandTimeout(addr)).await;
                }
            }
        });
    }

    /// Routes one native stack event.
    pub fn dispatch_stack_event(&mut self, event: HfpStackEvent) {
        match event {
            HfpStackEvent::ConnectionState(state, addr) => {
                self.on_connection_state_event(addr, state)
            }
            HfpStackEvent::AudioState(state, addr) => self.on_audio_state_event(addr, state),
            HfpStackEvent::SpeakerVolumeUpdate(volume, addr) => {
                self.on_speaker_volume(addr, volume)
            }
            HfpStackEvent::MicVolumeUpdate(volume, addr) => self.on_mic_volume(addr, volume),
            HfpStackEvent::BatteryLevelUpdate(level, addr) => self.on_battery_level(addr, level),
            HfpStackEvent::AnswerCall(addr) => self.on_answer_call(addr),
            HfpStackEvent::HangupCall(addr) => self.on_hangup_call(addr),
            HfpStackEvent::DialCall(number, addr) => self.on_dial_call(addr, number),
            HfpStackEvent::CallHold(chld, addr) => self.on_call_hold(addr, chld),
            HfpStackEvent::CurrentCallsQuery(addr) => self.on_current_calls_query(addr),
            HfpStackEvent::IndicatorQuery(addr) => self.on_indicator_query(addr),
            HfpStackEvent::OperatorQuery(addr) => self.on_operator_query(addr),
            HfpStackEvent::SubscriberNumberRequest(addr) => {
                self.on_subscriber_number_request(addr)
            }
            HfpStackEvent::IndicatorEnableUpdate(mask, addr) => {
                self.on_indicator_enable_update(addr, mask)
            }
            HfpStackEvent::KeyPressed(addr) => self.on_key_pressed(addr),
            HfpStackEvent::UnknownAt(raw, addr) => self.on_unknown_at(addr, raw),
        }
    }

    /// Executes one previously accepted profile command.
    pub fn dispatch_command(&mut self, cmd: HfpCommand) {
        match cmd {
            HfpCommand::Connect(addr) => {
                self.run_machine(addr, |machine, native| {
                    machine.action_connect(native);
                });
            }
            HfpCommand::Disconnect(addr) => {
                self.run_machine(addr, |machine, native| {
                    machine.action_disconnect(native);
                });
            }
            HfpCommand::ConnectAudio(addr) => {
                let sco_managed = self.config.sco_managed_by_audio;
                self.run_machine(addr, move |machine, native| {
                    machine.action_connect_audio(native, sco_managed);
                });
            }
            HfpCommand::DisconnectAudio(addr) => {
                self.run_machine(addr, |machine, native| {
                    machine.action_disconnect_audio(native);
                });
            }
        }
    }

    /// Handles the transition timer firing for one device.
    pub fn dispatch_command_timeout(&mut self, addr: BDAddr) {
        // The device may have been reaped between expiry and dispatch.
        let machine = match self.machines.get_mut(&addr) {
            Some(machine) => machine,
            None => return,
        };
        let prev_internal = machine.state();
        let prev_connection = machine.connection_state();
        let prev_audio = machine.broadcast_audio_state();

        let action = machine.action_on_command_timeout(self.native.as_mut());

        let state = machine.state();
        let connection = machine.connection_state();
        let audio = machine.broadcast_audio_state();

        match action {
            StateMachineTimeoutActions::Noop => {}
            _ => self.cmd_timeout.lock().unwrap().set_next(addr),
        }
        self.notify_transitions(addr, prev_connection, connection, prev_audio, audio);
        if state == ProfileState::Disconnected && prev_internal != ProfileState::Disconnected {
            self.on_device_disconnected(addr);
        }
    }

    /// Runs `f` against one device's machine and settles the aftermath:
    /// timer, callback notifications and registry cleanup. Unknown devices
    /// are ignored.
    fn run_machine<F>(&mut self, addr: BDAddr, f: F)
    where
        F: FnOnce(&mut HfpStateMachine, &mut dyn HfpNativeInterface),
    {
        let machine = match self.machines.get_mut(&addr) {
            Some(machine) => machine,
            None => return,
        };
        let prev_internal = machine.state();
        let prev_connection = machine.connection_state();
        let prev_audio = machine.broadcast_audio_state();

        f(machine, self.native.as_mut());

        let state = machine.state();
        let connection = machine.connection_state();
        let audio = machine.broadcast_audio_state();

        if state != prev_internal {
            self.update_timer(addr, state);
        }
        self.notify_transitions(addr, prev_connection, connection, prev_audio, audio);
        if state == ProfileState::Disconnected && prev_internal != ProfileState::Disconnected {
            self.on_device_disconnected(addr);
        }
    }

    fn update_timer(&mut self, addr: BDAddr, state: ProfileState) {
        let mut timeout = self.cmd_timeout.lock().unwrap();
        match state {
            ProfileState::Connecting
            | ProfileState::Disconnecting
            | ProfileState::AudioConnecting
            | ProfileState::AudioDisconnecting => timeout.set_next(addr),
            _ => timeout.cancel(&addr),
        }
    }

    /// Audio first, then connection; observers learn about audio loss before
    /// the connection that carried it goes away.
    fn notify_transitions(
        &self,
        addr: BDAddr,
        prev_connection: ConnectionState,
        connection: ConnectionState,
        prev_audio: AudioState,
        audio: AudioState,
    ) {
        if audio != prev_audio {
            info!("[{}]: audio state {:?} -> {:?}", addr, prev_audio, audio);
            self.for_all_callbacks(|callback| {
                callback.on_audio_state_changed(addr, prev_audio, audio);
            });
        }
        if connection != prev_connection {
            info!("[{}]: connection state {:?} -> {:?}", addr, prev_connection, connection);
            self.for_all_callbacks(|callback| {
                callback.on_connection_state_changed(addr, prev_connection, connection);
            });
        }
    }

    /// Cleanup once a device has fully disconnected: silence mode ends, the
    /// active role falls back if it held it, and the machine is reaped.
    fn on_device_disconnected(&mut self, addr: BDAddr) {
        if self.silenced.remove(&addr) {
            self.for_all_callbacks(|callback| callback.on_silence_mode_changed(addr, false));
        }
        if self.silenced_active == Some(addr) {
            self.silenced_active = None;
        }
        if self.active_device == Some(addr) {
            self.active_device = None;
            match self.select_fallback_device() {
                Some(next) => {
                    info!("[{}]: active device gone, falling back to {}", addr, next);
                    self.set_active_device_internal(next);
                }
                None => {
                    self.native.set_active_device(None);
                    self.for_all_callbacks(|callback| callback.on_active_device_changed(None));
                }
            }
        }
        self.machines.remove(&addr);
    }

    /// Earliest-connected device that can take the active role. Silenced
    /// devices and watches never take it implicitly.
    fn select_fallback_device(&self) -> Option<BDAddr> {
        self.machines
            .iter()
            .filter(|(_, machine)| {
                matches!(
                    machine.connection_state(),
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            })
            .filter(|(addr, _)| !self.silenced.contains(*addr))
            .filter(|(addr, _)| !is_cod_watch(self.adapter.get_class_of_device(**addr)))
            .min_by_key(|(_, machine)| machine.connecting_timestamp())
            .map(|(addr, _)| *addr)
    }

    fn set_active_device_internal(&mut self, addr: BDAddr) -> bool {
        if self.active_device == Some(addr) {
            return true;
        }
        let connected = self
            .machines
            .get(&addr)
            .map_or(false, |machine| machine.connection_state() == ConnectionState::Connected);
        if !connected {
            warn!("[{}]: cannot activate a device without a service level connection", addr);
            return false;
        }
        if !self.audio_route_allowed && self.telephony.is_in_call() {
            warn!("[{}]: active device change blocked while a call is in progress", addr);
            return false;
        }
        // At most one device may carry audio; tear the previous one down.
        if let Some(prev) = self.active_device.take() {
            self.run_machine(prev, |machine, native| {
                if machine.state() == ProfileState::AudioOn {
                    machine.action_disconnect_audio(native);
                }
            });
        }
        info!("[{}]: becoming the active device", addr);
        self.active_device = Some(addr);
        self.native.set_active_device(Some(addr));
        if self.telephony.is_ringing() {
            // Ring in-band through the new device and bring audio up so the
            // caller is heard the moment the call is answered.
            self.native.send_bsir(addr, true);
            self.post_command(HfpCommand::ConnectAudio(addr));
        }
        self.for_all_callbacks(|callback| callback.on_active_device_changed(Some(addr)));
        true
    }

    fn clear_active_device(&mut self) {
        let prev = match self.active_device.take() {
            Some(prev) => prev,
            None => return,
        };
        self.run_machine(prev, |machine, native| {
            if machine.state() == ProfileState::AudioOn {
                machine.action_disconnect_audio(native);
            }
        });
        self.native.set_active_device(None);
        self.for_all_callbacks(|callback| callback.on_active_device_changed(None));
    }

    fn phone_state_changed_internal(&mut self, state: PhoneState, number: &str) {
        self.phone_state = state;
        for (addr, machine) in &self.machines {
            if machine.connection_state() == ConnectionState::Connected {
                self.native.phone_state_change(*addr, &self.phone_state, number);
            }
        }
    }

    fn connected_device_count(&self) -> usize {
        self.machines
            .values()
            .filter(|machine| machine.connection_state() != ConnectionState::Disconnected)
            .count()
    }

    fn known_device(&self, addr: BDAddr, what: &str) -> bool {
        if self.machines.contains_key(&addr) {
            return true;
        }
        warn!("[{}]: dropping {} for unknown device", addr, what);
        false
    }

    fn post_command(&self, cmd: HfpCommand) {
        let txl = self.tx.clone();
        tokio::spawn(async move {
            let _ = txl.send(Message::HfpCommand(cmd)).await;
        });
    }

    fn for_all_callbacks<F>(&self, f: F)
    where
        F: Fn(&(dyn IBluetoothHfpCallback + Send)),
    {
        for (_, callback) in &self.callbacks {
            f(callback.as_ref());
        }
    }

    fn on_connection_state_event(&mut self, addr: BDAddr, state: HfpConnectionState) {
        if !self.machines.contains_key(&addr) {
            match state {
                HfpConnectionState::Connecting
                | HfpConnectionState::Connected
                | HfpConnectionState::SlcConnected => {
                    info!("[{}]: incoming connection", addr);
                    self.machines.insert(addr, HfpStateMachine::new(addr));
                }
                HfpConnectionState::Disconnected | HfpConnectionState::Disconnecting => {
                    panic!("[{:?}]: teardown event for unknown device", addr);
                }
            }
        }
        self.run_machine(addr, |machine, _native| machine.action_on_connection_state(state));
    }

    fn on_audio_state_event(&mut self, addr: BDAddr, state: HfpAudioState) {
        if !self.known_device(addr, "audio state event") {
            return;
        }
        self.run_machine(addr, |machine, native| machine.action_on_audio_state(state, native));
    }

    fn on_speaker_volume(&mut self, addr: BDAddr, volume: u8) {
        match self.machines.get_mut(&addr) {
            Some(machine) => machine.on_speaker_volume(volume),
            None => {
                warn!("[{}]: dropping speaker volume for unknown device", addr);
                return;
            }
        }
        self.for_all_callbacks(|callback| callback.on_speaker_volume_changed(addr, volume));
    }

    fn on_mic_volume(&mut self, addr: BDAddr, volume: u8) {
        match self.machines.get_mut(&addr) {
            Some(machine) => machine.on_mic_volume(volume),
            None => warn!("[{}]: dropping mic volume for unknown device", addr),
        }
    }

    fn on_battery_level(&mut self, addr: BDAddr, level: u8) {
        if !self.known_device(addr, "battery level") {
            return;
        }
        self.for_all_callbacks(|callback| callback.on_battery_level_changed(addr, level));
    }

    fn on_answer_call(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "answer") {
            return;
        }
        self.telephony.answer_call();
    }

    fn on_hangup_call(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "hangup") {
            return;
        }
        self.telephony.hangup_call();
    }

    fn on_dial_call(&mut self, addr: BDAddr, number: String) {
        if !self.known_device(addr, "dial") {
            return;
        }
        let number = if number.is_empty() {
            match self.phonebook.last_outgoing_number() {
                Some(number) => number,
                None => {
                    warn!("[{}]: redial requested with an empty call log", addr);
                    self.native.at_response_error(addr, CmeError::AgFailure);
                    return;
                }
            }
        } else {
            number
        };
        if self.telephony.dial_outgoing_call(&number) {
            self.native.at_response_ok(addr);
        } else {
            self.native.at_response_error(addr, CmeError::AgFailure);
        }
    }

    fn on_call_hold(&mut self, addr: BDAddr, chld: CallHoldCommand) {
        if !self.known_device(addr, "call hold") {
            return;
        }
        if self.telephony.process_call_hold(chld) {
            self.native.at_response_ok(addr);
        } else {
            warn!("[{}]: call hold {:?} rejected", addr, chld);
            self.native.at_response_error(addr, CmeError::AgFailure);
        }
    }

    fn on_current_calls_query(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "current calls query") {
            return;
        }
        if self.virtual_call_active {
            // One synthetic outgoing call stands in for the real list.
            self.native.clcc_response(addr, 1, false, CallState::Active, false, "");
        } else {
            for call in self.telephony.current_calls() {
                self.native.clcc_response(
                    addr,
                    call.index,
                    call.dir_incoming,
                    call.state,
                    false,
                    &call.number,
                );
            }
        }
        // Index zero terminates the +CLCC list.
        self.native.clcc_response(addr, 0, false, CallState::Idle, false, "");
    }

    fn on_indicator_query(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "indicator query") {
            return;
        }
        // An ongoing call implies service even when the radio says otherwise.
        let network_available = self.telephony.network_available() || self.phone_state.num_active > 0;
        self.native.cind_response(
            addr,
            network_available,
            self.phone_state.num_active,
            self.phone_state.num_held,
            self.phone_state.state,
            self.telephony.signal_strength(),
            self.telephony.is_roaming(),
            self.telephony.battery_level(),
        );
    }

    fn on_operator_query(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "operator query") {
            return;
        }
        let operator = self.telephony.network_operator().unwrap_or_default();
        self.native.cops_response(addr, &operator);
    }

    fn on_subscriber_number_request(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "subscriber number request") {
            return;
        }
        if let Some(number) = self.telephony.subscriber_number() {
            let response = format!("+CNUM: ,\"{}\",{},,4", number, toa_from_number(&number));
            self.native.at_response_string(addr, &response);
        }
        self.native.at_response_ok(addr);
    }

    fn on_indicator_enable_update(&mut self, addr: BDAddr, mask: AgIndicatorState) {
        match self.machines.get_mut(&addr) {
            Some(machine) => machine.set_ag_indicator_mask(mask),
            None => warn!("[{}]: dropping indicator mask for unknown device", addr),
        }
    }

    /// HSP-style button: the most useful call action for the current state.
    fn on_key_pressed(&mut self, addr: BDAddr) {
        if !self.known_device(addr, "key press") {
            return;
        }
        if self.telephony.is_ringing() {
            self.telephony.answer_call();
            return;
        }
        let audio_up = self
            .machines
            .get(&addr)
            .map_or(false, |machine| machine.state() == ProfileState::AudioOn);
        if self.telephony.is_in_call() {
            if audio_up {
                self.telephony.hangup_call();
            } else {
                // Pull the call audio over to the device that was pressed.
                self.set_active_device_internal(addr);
            }
        } else if audio_up {
            self.disconnect_audio(addr);
        } else {
            match self.phonebook.last_outgoing_number() {
                Some(number) => {
                    if !self.telephony.dial_outgoing_call(&number) {
                        self.native.at_response_error(addr, CmeError::AgFailure);
                    }
                }
                None => {
                    warn!("[{}]: key press redial with an empty call log", addr);
                    self.native.at_response_error(addr, CmeError::AgFailure);
                }
            }
        }
    }

    fn on_unknown_at(&mut self, addr: BDAddr, raw: String) {
        if !self.known_device(addr, "at command") {
            return;
        }
        let normalized = normalize_unknown_at(&raw);
        match parse_at_command_data(&normalized) {
            Ok(at) => self.process_parsed_at(addr, at),
            Err(e) => {
                warn!("[{}]: unparseable at command: {}", addr, e);
                self.native.at_response_error(addr, CmeError::AgFailure);
            }
        }
    }

    fn process_parsed_at(&mut self, addr: BDAddr, at: AtCommand) {
        debug!("[{}]: at command {:?} {}", addr, at.at_type, at.command);
        match at.command.as_str() {
            "CSCS" => self.phonebook.handle_cscs(addr, &at, self.native.as_mut()),
            "CPBS" => self.phonebook.handle_cpbs(addr, &at, self.native.as_mut()),
            "CPBR" => self.phonebook.handle_cpbr(addr, &at, self.native.as_mut()),
            "BIA" => self.handle_bia(addr, &at),
            "XAPL" => self.handle_xapl(addr, &at),
            "IPHONEACCEV" | "XEVENT" => self.handle_vendor_event(addr, &at),
            "CGMI" => self.reply_static(addr, MANUFACTURER_NAME),
            "CGMM" => self.reply_static(addr, MODEL_NAME),
            "CGMR" => self.reply_static(addr, env!("CARGO_PKG_VERSION")),
            "CGSN" => self.reply_static(addr, SERIAL_NUMBER),
            _ => {
                warn!("[{}]: unsupported at command {}", addr, at.raw);
                self.native.at_response_error(addr, CmeError::OperationNotSupported);
            }
        }
    }

    /// AT+BIA lists indicator activations positionally; empty or malformed
    /// positions leave the current setting alone.
    fn handle_bia(&mut self, addr: BDAddr, at: &AtCommand) {
        if let Some(machine) = self.machines.get_mut(&addr) {
            let mut mask = machine.ag_indicator_mask();
            if let Some(args) = at.raw_args.as_ref() {
                for (position, arg) in args.iter().enumerate() {
                    let flag = match position + 1 {
                        1 => AgIndicatorState::SERVICE,
                        5 => AgIndicatorState::SIGNAL,
                        6 => AgIndicatorState::ROAM,
                        7 => AgIndicatorState::BATTERY,
                        _ => continue,
                    };
                    match arg.as_str() {
                        "0" => mask.remove(flag),
                        "1" => mask.insert(flag),
                        _ => {}
                    }
                }
            }
            machine.set_ag_indicator_mask(mask);
        }
        self.native.at_response_ok(addr);
    }

    fn handle_xapl(&mut self, addr: BDAddr, at: &AtCommand) {
        match at.raw_args.as_ref() {
            Some(args) if args.len() == 2 => {
                self.native.at_response_string(addr, XAPL_RESPONSE);
                self.native.at_response_ok(addr);
            }
            _ => {
                warn!("[{}]: malformed xapl command {}", addr, at.raw);
                self.native.at_response_error(addr, CmeError::OperationNotSupported);
            }
        }
    }

    /// Vendor battery carriers (AT+IPHONEACCEV, AT+XEVENT). The parser
    /// already reduced them to a percentage when one was present.
    fn handle_vendor_event(&mut self, addr: BDAddr, at: &AtCommand) {
        if let Some(percent) = at
            .data
            .as_ref()
            .and_then(|data| data.get(&AtCommandDataType::BatteryLevel))
            .and_then(|value| value.parse::<u8>().ok())
        {
            self.on_battery_level(addr, percent);
        }
        self.native.at_response_ok(addr);
    }

    fn reply_static(&mut self, addr: BDAddr, response: &str) {
        self.native.at_response_string(addr, response);
        self.native.at_response_ok(addr);
    }
}

impl IBluetoothHfp for BluetoothHfp {
    fn register_callback(&mut self, callback: Box<dyn IBluetoothHfpCallback + Send>) -> u32 {
        self.callback_last_id += 1;
        self.callbacks.push((self.callback_last_id, callback));
        self.callback_last_id
    }

    fn unregister_callback(&mut self, callback_id: u32) -> bool {
        let registered = self.callbacks.len();
        self.callbacks.retain(|(id, _)| *id != callback_id);
        self.callbacks.len() != registered
    }

    fn connect(&mut self, addr: BDAddr) -> bool {
        if self.policy_store.get_profile_connection_policy(addr) == ConnectionPolicy::Forbidden {
            warn!("[{}]: connect refused, policy forbids the profile", addr);
            return false;
        }
        if !self.config.allow_unbonded && self.adapter.get_bond_state(addr) != BondState::Bonded {
            warn!("[{}]: connect refused, device is not bonded", addr);
            return false;
        }
        let has_hf = self
            .adapter
            .get_remote_uuids(addr)
            .iter()
            .any(|uuid| UuidHelper::is_known_profile(uuid) == Some(Profile::Handsfree));
        if !has_hf {
            warn!("[{}]: connect refused, no Handsfree UUID", addr);
            return false;
        }
        if let Some(machine) = self.machines.get(&addr) {
            if machine.connection_state() != ConnectionState::Disconnected {
                warn!("[{}]: connect refused, already {:?}", addr, machine.connection_state());
                return false;
            }
        }
        self.machines.entry(addr).or_insert_with(|| HfpStateMachine::new(addr));
        if self.connected_device_count() >= self.config.max_connected_devices {
            warn!(
                "[{}]: connect refused, {} devices already connected",
                addr, self.config.max_connected_devices
            );
            return false;
        }
        self.post_command(HfpCommand::Connect(addr));
        true
    }

    fn disconnect(&mut self, addr: BDAddr) -> bool {
        match self.machines.get(&addr) {
            Some(machine) if machine.connection_state() != ConnectionState::Disconnected => {
                self.post_command(HfpCommand::Disconnect(addr));
                true
            }
            Some(_) => {
                warn!("[{}]: disconnect refused, already disconnected", addr);
                false
            }
            None => {
                warn!("[{}]: disconnect refused, unknown device", addr);
                false
            }
        }
    }

    fn connect_audio(&mut self, addr: BDAddr) -> StatusCode {
        let machine = match self.machines.get(&addr) {
            Some(machine) if machine.connection_state() == ConnectionState::Connected => machine,
            _ => {
                warn!("[{}]: connect audio refused, no service level connection", addr);
                return StatusCode::ErrorProfileNotConnected;
            }
        };
        if self.active_device != Some(addr) {
            warn!("[{}]: connect audio refused, not the active device", addr);
            return StatusCode::ErrorNotActiveDevice;
        }
        if machine.broadcast_audio_state() != AudioState::Disconnected {
            // Already on its way up; nothing to post.
            return StatusCode::Success;
        }
        self.post_command(HfpCommand::ConnectAudio(addr));
        StatusCode::Success
    }

    fn disconnect_audio(&mut self, addr: BDAddr) -> StatusCode {
        let machine = match self.machines.get(&addr) {
            Some(machine) if machine.connection_state() == ConnectionState::Connected => machine,
            _ => {
                warn!("[{}]: disconnect audio refused, no service level connection", addr);
                return StatusCode::ErrorProfileNotConnected;
            }
        };
        if machine.broadcast_audio_state() == AudioState::Disconnected {
            warn!("[{}]: disconnect audio refused, audio already down", addr);
            return StatusCode::ErrorAudioDeviceAlreadyDisconnected;
        }
        self.post_command(HfpCommand::DisconnectAudio(addr));
        StatusCode::Success
    }

    fn set_active_device(&mut self, addr: Option<BDAddr>) -> bool {
        match addr {
            Some(addr) => self.set_active_device_internal(addr),
            None => {
                self.clear_active_device();
                true
            }
        }
    }

    fn get_active_device(&self) -> Option<BDAddr> {
        self.active_device
    }

    fn set_silence_mode(&mut self, addr: BDAddr, silence: bool) -> bool {
        let connected = self
            .machines
            .get(&addr)
            .map_or(false, |machine| machine.connection_state() == ConnectionState::Connected);
        if !connected {
            debug!("[{}]: silence mode {} ignored without a service level connection", addr, silence);
            return true;
        }
        if silence == self.silenced.contains(&addr) {
            return true;
        }
        if silence {
            self.silenced.insert(addr);
            if self.active_device == Some(addr) {
                // Remember the device so unsilencing restores it.
                self.silenced_active = Some(addr);
                self.active_device = None;
                self.run_machine(addr, |machine, native| {
                    if machine.state() == ProfileState::AudioOn {
                        machine.action_disconnect_audio(native);
                    }
                });
                match self.select_fallback_device() {
                    Some(next) => {
                        info!("[{}]: silenced, handing the active role to {}", addr, next);
                        self.set_active_device_internal(next);
                    }
                    None => {
                        self.native.set_active_device(None);
                        self.for_all_callbacks(|callback| {
                            callback.on_active_device_changed(None)
                        });
                    }
                }
            }
        } else {
            self.silenced.remove(&addr);
            if self.silenced_active == Some(addr) {
                self.silenced_active = None;
                self.set_active_device_internal(addr);
            }
        }
        self.for_all_callbacks(|callback| callback.on_silence_mode_changed(addr, silence));
        true
    }

    fn get_silence_mode(&self, addr: BDAddr) -> bool {
        self.silenced.contains(&addr)
    }

    fn get_connection_state(&self, addr: BDAddr) -> ConnectionState {
        self.machines
            .get(&addr)
            .map_or(ConnectionState::Disconnected, |machine| machine.connection_state())
    }

    fn get_audio_state(&self, addr: BDAddr) -> AudioState {
        self.machines.get(&addr).map_or(AudioState::Disconnected, |machine| machine.audio_state())
    }

    fn get_connected_devices(&self) -> Vec<BDAddr> {
        self.machines
            .iter()
            .filter(|(_, machine)| machine.connection_state() == ConnectionState::Connected)
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn get_devices_matching_connection_states(&self, states: &[ConnectionState]) -> Vec<BDAddr> {
        self.machines
            .iter()
            .filter(|(_, machine)| states.contains(&machine.connection_state()))
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn get_fallback_candidates(&self) -> Vec<BDAddr> {
        self.machines
            .iter()
            .filter(|(_, machine)| {
                matches!(
                    machine.connection_state(),
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            })
            .filter(|(addr, _)| Some(**addr) != self.active_device)
            .filter(|(addr, _)| !is_cod_watch(self.adapter.get_class_of_device(**addr)))
            .map(|(addr, _)| *addr)
            .collect()
    }

    fn get_device(&self, addr: BDAddr) -> Option<DeviceConnection> {
        self.machines.get(&addr).map(|machine| DeviceConnection {
            addr,
            connection_state: machine.connection_state(),
            audio_state: machine.audio_state(),
            connecting_timestamp: machine.connecting_timestamp(),
            connection_policy: self.policy_store.get_profile_connection_policy(addr),
        })
    }

    fn set_connection_policy(&mut self, addr: BDAddr, policy: ConnectionPolicy) -> bool {
        if !self.policy_store.set_profile_connection_policy(addr, policy) {
            return false;
        }
        match policy {
            ConnectionPolicy::Allowed => {
                self.connect(addr);
            }
            ConnectionPolicy::Forbidden => {
                self.disconnect(addr);
            }
            ConnectionPolicy::Unknown => {}
        }
        true
    }

    fn get_connection_policy(&self, addr: BDAddr) -> ConnectionPolicy {
        self.policy_store.get_profile_connection_policy(addr)
    }

    fn start_sco_using_virtual_voice_call(&mut self) -> bool {
        let active = match self.active_device {
            Some(addr) => addr,
            None => {
                warn!("cannot start a virtual voice call without an active device");
                return false;
            }
        };
        if self.virtual_call_active {
            warn!("virtual voice call already running");
            return false;
        }
        info!("[{}]: starting virtual voice call", active);
        self.virtual_call_active = true;
        self.phone_state_changed_internal(
            PhoneState { num_active: 0, num_held: 0, state: CallState::Dialing },
            "",
        );
        self.phone_state_changed_internal(
            PhoneState { num_active: 0, num_held: 0, state: CallState::Alerting },
            "",
        );
        self.phone_state_changed_internal(
            PhoneState { num_active: 1, num_held: 0, state: CallState::Idle },
            "",
        );
        self.connect_audio(active);
        true
    }

    fn stop_sco_using_virtual_voice_call(&mut self) -> bool {
        if !self.virtual_call_active {
            warn!("no virtual voice call to stop");
            return false;
        }
        info!("stopping virtual voice call");
        self.virtual_call_active = false;
        self.phone_state_changed_internal(PhoneState::default(), "");
        if let Some(active) = self.active_device {
            self.disconnect_audio(active);
        }
        true
    }

    fn phone_state_changed(&mut self, state: PhoneState, number: String) {
        // A real update supersedes any synthesized call state.
        self.virtual_call_active = false;
        self.phone_state_changed_internal(state, &number);
    }

    fn set_audio_route_allowed(&mut self, allowed: bool) {
        self.audio_route_allowed = allowed;
    }

    fn get_audio_route_allowed(&self) -> bool {
        self.audio_route_allowed
    }
}
