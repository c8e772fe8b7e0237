//! This library provides helper functions to parse cod.

struct Class {
    major: u32,
    minor: u32,
}

impl Class {
    fn new(cod: u32) -> Class {
        Class { major: (cod & 0x1f00) >> 8, minor: (cod & 0xff) }
    }
}

const MAJOR_CLASS_WEARABLE: u32 = 0x07;
const MINOR_CLASS_WRIST_WATCH: u32 = 0x01;

/// Wearable wrist watch per the Bluetooth assigned numbers.
pub fn is_cod_watch(cod: u32) -> bool {
    let c = Class::new(cod);
    c.major == MAJOR_CLASS_WEARABLE && (c.minor >> 2) == MINOR_CLASS_WRIST_WATCH
}
