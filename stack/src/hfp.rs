//! Types crossing the boundary to the native HFP half: stack events coming
//! up, and the command surface the service drives downward.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use crate::BDAddr;

/// Connection state reported by the native stack. `SlcConnected` means the
/// service-level connection finished its feature negotiation; only then is
/// the profile usable.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum HfpConnectionState {
    Disconnected = 0,
    Connecting,
    Connected,
    SlcConnected,
    Disconnecting,
}

impl From<u32> for HfpConnectionState {
    fn from(item: u32) -> Self {
        HfpConnectionState::from_u32(item).unwrap()
    }
}

/// SCO audio state reported by the native stack.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum HfpAudioState {
    Disconnected = 0,
    Connecting,
    Connected,
    Disconnecting,
}

impl From<u32> for HfpAudioState {
    fn from(item: u32) -> Self {
        HfpAudioState::from_u32(item).unwrap()
    }
}

/// State of a single call reported to headsets.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq)]
#[repr(u32)]
pub enum CallState {
    Idle = 0,
    Incoming,
    Dialing,
    Alerting,
    Active,
    Held,
}

/// Information about a single call for +CLCC enumeration.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub index: i32,
    pub dir_incoming: bool,
    pub state: CallState,
    pub number: String,
}

/// Aggregate call state pushed to headsets on every telephony change.
/// `state` carries the call-setup state; established calls are counted.
#[derive(Debug, Clone)]
pub struct PhoneState {
    pub num_active: i32,
    pub num_held: i32,
    pub state: CallState,
}

impl Default for PhoneState {
    fn default() -> Self {
        PhoneState { num_active: 0, num_held: 0, state: CallState::Idle }
    }
}

/// Three-way calling actions requested with AT+CHLD.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq)]
#[repr(u32)]
pub enum CallHoldCommand {
    ReleaseHeld = 0,
    ReleaseActiveAcceptHeld,
    HoldActiveAcceptHeld,
    AddHeldToConf,
}

impl From<u32> for CallHoldCommand {
    fn from(item: u32) -> Self {
        CallHoldCommand::from_u32(item).unwrap()
    }
}

/// Extended AT error codes per GSM 07.07, reported as `+CME ERROR: <n>`.
/// `AgFailure` doubles as the generic error when nothing closer fits.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq)]
#[repr(u32)]
pub enum CmeError {
    AgFailure = 0,
    NoConnectionToPhone = 1,
    OperationNotAllowed = 3,
    OperationNotSupported = 4,
    PhSimPinRequired = 5,
    SimNotInserted = 10,
    SimPinRequired = 11,
    SimPukRequired = 12,
    SimFailure = 13,
    SimBusy = 14,
    WrongPassword = 16,
    SimPin2Required = 17,
    SimPuk2Required = 18,
    MemoryFull = 20,
    InvalidIndex = 21,
    MemoryFailure = 23,
    TextStringTooLong = 24,
    TextHasInvalidChars = 25,
    DialStringTooLong = 26,
    DialStringHasInvalidChars = 27,
    NoNetworkService = 30,
    NetworkTimeout = 31,
    EmergencyCallsOnly = 32,
}

bitflags! {
    /// AG status indicators a headset can mask with AT+BIA. Call related
    /// indicators are mandatory and cannot be masked.
    pub struct AgIndicatorState: u32 {
        const SERVICE = 1 << 0;
        const ROAM = 1 << 1;
        const SIGNAL = 1 << 2;
        const BATTERY = 1 << 3;
    }
}

/// Callbacks from the native HFP half.
#[derive(Debug, Clone)]
pub enum HfpStackEvent {
    ConnectionState(HfpConnectionState, BDAddr),
    AudioState(HfpAudioState, BDAddr),
    /// Speaker gain chosen on the headset, 0 to 15.
    SpeakerVolumeUpdate(u8, BDAddr),
    /// Microphone gain chosen on the headset, 0 to 15.
    MicVolumeUpdate(u8, BDAddr),
    /// Battery percentage 0 to 100 reported through HF indicators.
    BatteryLevelUpdate(u8, BDAddr),
    AnswerCall(BDAddr),
    HangupCall(BDAddr),
    /// Dial request; an empty number means redial.
    DialCall(String, BDAddr),
    CallHold(CallHoldCommand, BDAddr),
    /// AT+CLCC.
    CurrentCallsQuery(BDAddr),
    /// AT+CIND read.
    IndicatorQuery(BDAddr),
    /// AT+COPS read.
    OperatorQuery(BDAddr),
    /// AT+CNUM.
    SubscriberNumberRequest(BDAddr),
    /// AT+BIA.
    IndicatorEnableUpdate(AgIndicatorState, BDAddr),
    /// HSP button press.
    KeyPressed(BDAddr),
    /// Anything the native stack does not consume itself, raw.
    UnknownAt(String, BDAddr),
}

/// Dispatcher the native event loop uses to hand events to the service.
pub struct HfpStackEventDispatcher {
    pub dispatch: Box<dyn Fn(HfpStackEvent) + Send>,
}

/// Commands the service issues towards the native HFP stack. Calls must not
/// block; completion is reported back through stack events.
pub trait HfpNativeInterface {
    fn connect(&mut self, addr: BDAddr) -> bool;
    fn disconnect(&mut self, addr: BDAddr) -> bool;
    fn connect_audio(&mut self, addr: BDAddr) -> bool;
    fn disconnect_audio(&mut self, addr: BDAddr) -> bool;
    /// Switches which device the native stack routes call audio to. `None`
    /// clears the selection.
    fn set_active_device(&mut self, addr: Option<BDAddr>) -> bool;
    /// Applies a speaker gain on the headset, 0 to 15.
    fn set_volume(&mut self, addr: BDAddr, volume: u8) -> bool;
    /// Updates in-band ringtone signalling for the device.
    fn send_bsir(&mut self, addr: BDAddr, enabled: bool) -> bool;
    /// Pushes the aggregate call state; `number` accompanies call setup.
    fn phone_state_change(&mut self, addr: BDAddr, state: &PhoneState, number: &str) -> bool;
    /// Terminates a command exchange with OK.
    fn at_response_ok(&mut self, addr: BDAddr) -> bool;
    /// Terminates a command exchange with ERROR and the given CME code.
    fn at_response_error(&mut self, addr: BDAddr, cme: CmeError) -> bool;
    /// Sends one unsolicited or intermediate response line.
    fn at_response_string(&mut self, addr: BDAddr, response: &str) -> bool;
    /// Sends one +CLCC line; index 0 with an empty number ends the list.
    fn clcc_response(
        &mut self,
        addr: BDAddr,
        index: i32,
        dir_incoming: bool,
        state: CallState,
        mpty: bool,
        number: &str,
    ) -> bool;
    /// Answers an AT+CIND read with the full indicator set.
    #[allow(clippy::too_many_arguments)]
    fn cind_response(
        &mut self,
        addr: BDAddr,
        network_available: bool,
        num_active: i32,
        num_held: i32,
        call_setup_state: CallState,
        signal: i32,
        roam: bool,
        battery: i32,
    ) -> bool;
    /// Answers an AT+COPS read; an empty operator means none.
    fn cops_response(&mut self, addr: BDAddr, operator: &str) -> bool;
}
