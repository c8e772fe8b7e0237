//! Hands-Free Profile audio gateway service.
//!
//! The service tracks one connection state machine per peer device, drives
//! service-level connection and SCO audio setup with bounded timers, and
//! answers the AT commands a headset sends once its connection is up.
//! Everything runs on a single serialized dispatch queue.

pub mod bluetooth_hfp;
pub mod config_util;
pub mod hfp;
pub mod phonebook;
pub mod state_machine;
pub mod uuid;

use std::fmt::{Debug, Display, Formatter, Result};
use std::sync::{Arc, Mutex};

use log::info;
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::bluetooth_hfp::{BluetoothHfp, HfpCommand};
use crate::hfp::HfpStackEvent;

/// A six octet Bluetooth device address.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BDAddr {
    val: [u8; 6],
}

impl Debug for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.write_fmt(format_args!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        ))
    }
}

impl Display for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.write_fmt(format_args!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        ))
    }
}

impl BDAddr {
    /// Constructs a BDAddr from a string in big-endian format.
    pub fn from_string<S: Into<String>>(addr: S) -> Option<BDAddr> {
        let addr: String = addr.into();
        let s = addr.split(':').collect::<Vec<&str>>();
        if s.len() != 6 {
            return None;
        }
        let mut raw: [u8; 6] = [0; 6];
        for i in 0..s.len() {
            raw[i] = match u8::from_str_radix(s[i], 16) {
                Ok(v) => v,
                Err(_) => return None,
            };
        }
        Some(BDAddr { val: raw })
    }

    /// Constructs a BDAddr from a vector of 6 bytes.
    pub fn from_byte_vec(raw_addr: &Vec<u8>) -> Option<BDAddr> {
        if raw_addr.len() != 6 {
            return None;
        }
        let mut raw: [u8; 6] = [0; 6];
        raw.copy_from_slice(&raw_addr[0..6]);
        Some(BDAddr { val: raw })
    }

    pub fn to_byte_arr(&self) -> [u8; 6] {
        self.val
    }
}

/// Messages serialized onto the main dispatch queue.
pub enum Message {
    /// Event delivered by the native stack.
    Hfp(HfpStackEvent),
    /// Profile command accepted by the service API.
    HfpCommand(HfpCommand),
    /// The pending-transition timer fired for a device.
    CommandTimeout(BDAddr),
}

/// Umbrella object for the service and its dispatch queue.
pub struct Stack {}

impl Stack {
    /// Creates the main dispatch channel.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel::<Message>(1)
    }

    /// Dispatches messages to the service until all senders are dropped.
    pub async fn dispatch(mut rx: Receiver<Message>, hfp: Arc<Mutex<Box<BluetoothHfp>>>) {
        hfp.lock().unwrap().spawn_timeout_listener();
        loop {
            let m = rx.recv().await;

            if m.is_none() {
                info!("dispatch loop exiting, channel closed");
                break;
            }

            match m.unwrap() {
                Message::Hfp(ev) => {
                    hfp.lock().unwrap().dispatch_stack_event(ev);
                }
                Message::HfpCommand(cmd) => {
                    hfp.lock().unwrap().dispatch_command(cmd);
                }
                Message::CommandTimeout(addr) => {
                    hfp.lock().unwrap().dispatch_command_timeout(addr);
                }
            }
        }
    }
}
