//! UUID helpers for profile identification.

use lazy_static::lazy_static;
use num_derive::{FromPrimitive, ToPrimitive};

use std::collections::HashMap;

pub type Uuid128Bit = [u8; 16];

pub const HFP: &str = "0000111E-0000-1000-8000-00805F9B34FB";
pub const HFP_AG: &str = "0000111F-0000-1000-8000-00805F9B34FB";

const BASE_UUID_NUM: u128 = 0x0000000000001000800000805f9b34fbu128;
const BASE_UUID_MASK: u128 = !(0xffffffffu128 << 96);

/// List of profiles the service knows about.
#[derive(Clone, Copy, Debug, Hash, PartialEq, PartialOrd, Eq, Ord, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Profile {
    Handsfree,
    HandsfreeAudioGateway,
}

lazy_static! {
    static ref SUPPORTED_PROFILES: HashMap<Uuid128Bit, Profile> = [
        (UuidHelper::from_string(HFP).unwrap(), Profile::Handsfree),
        (UuidHelper::from_string(HFP_AG).unwrap(), Profile::HandsfreeAudioGateway),
    ]
    .iter()
    .cloned()
    .collect();
}

pub struct UuidHelper {}

impl UuidHelper {
    /// Identifies the profile of the given UUID if known.
    pub fn is_known_profile(uuid: &Uuid128Bit) -> Option<Profile> {
        SUPPORTED_PROFILES.get(uuid).cloned()
    }

    /// Converts a UUID in canonical string form into a byte array. The
    /// string may carry hyphens or not.
    pub fn from_string<S: Into<String>>(raw: S) -> Option<Uuid128Bit> {
        let raw: String = raw.into();
        let uuid: String = raw.chars().filter(|c| *c != '-').collect();
        if uuid.len() != 32 {
            return None;
        }
        let mut uuid128: Uuid128Bit = [0; 16];
        for i in 0..16 {
            uuid128[i] = u8::from_str_radix(&uuid[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(uuid128)
    }

    /// Formats a UUID in the canonical hyphenated form.
    pub fn to_string(uuid: &Uuid128Bit) -> String {
        format!(
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            uuid[0], uuid[1], uuid[2], uuid[3], uuid[4], uuid[5], uuid[6], uuid[7],
            uuid[8], uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
        )
    }

    /// The assigned 16-bit number of a UUID built on the Bluetooth base
    /// UUID, or `None` for anything outside that range.
    pub fn to_16bit(uuid: &Uuid128Bit) -> Option<u16> {
        let num = u128::from_be_bytes(*uuid);
        if (num & BASE_UUID_MASK) != BASE_UUID_NUM || (num >> 96) > u16::MAX.into() {
            return None;
        }
        Some((num >> 96) as u16)
    }
}
