//! Phonebook-over-AT access for connected headsets.
//!
//! Carkits browse the phone's contacts and call logs with AT+CPBS, AT+CPBR
//! and AT+CSCS. The actual data comes from an injected [`PhonebookQuery`]
//! so the service stays independent of where contacts live.

use log::debug;

use bt_utils::at_command_parser::{AtCommand, AtCommandType};

use crate::hfp::{CmeError, HfpNativeInterface};
use crate::BDAddr;

/// AT phone number length limit reported in +CPBR responses.
const MAX_PHONE_NUMBER_CHARS: usize = 30;
/// Name length limit reported in +CPBR responses.
const MAX_NAME_CHARS: usize = 30;
/// Longest contact name that survives GSM alphabet conversion.
const MAX_NAME_CHARS_GSM: usize = 28;

const SUPPORTED_CHARSETS: [&str; 3] = ["UTF-8", "IRA", "GSM"];

/// Type-of-address octet. 145 marks an international number.
pub(crate) fn toa_from_number(number: &str) -> i32 {
    if number.starts_with('+') {
        145
    } else {
        129
    }
}

/// Phonebook storages selectable with AT+CPBS. SIM storage is not exposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhonebookStorage {
    /// Phone memory, the contact list.
    Me,
    /// Dialed calls.
    Dc,
    /// Received calls.
    Rc,
    /// Missed calls.
    Mc,
}

impl PhonebookStorage {
    pub fn from_at_name(name: &str) -> Option<Self> {
        match name.trim().trim_matches('"').to_uppercase().as_str() {
            "ME" => Some(PhonebookStorage::Me),
            "DC" => Some(PhonebookStorage::Dc),
            "RC" => Some(PhonebookStorage::Rc),
            "MC" => Some(PhonebookStorage::Mc),
            _ => None,
        }
    }

    pub fn at_name(&self) -> &'static str {
        match self {
            PhonebookStorage::Me => "ME",
            PhonebookStorage::Dc => "DC",
            PhonebookStorage::Rc => "RC",
            PhonebookStorage::Mc => "MC",
        }
    }

    fn call_log_type(&self) -> Option<CallLogType> {
        match self {
            PhonebookStorage::Me => None,
            PhonebookStorage::Dc => Some(CallLogType::Outgoing),
            PhonebookStorage::Rc => Some(CallLogType::Incoming),
            PhonebookStorage::Mc => Some(CallLogType::Missed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallLogType {
    Outgoing,
    Incoming,
    Missed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhoneNumberType {
    Home,
    Mobile,
    Work,
    Fax,
    Other,
}

impl PhoneNumberType {
    /// Letter appended to the contact name so carkits can tell numbers of
    /// the same contact apart.
    fn suffix(&self) -> &'static str {
        match self {
            PhoneNumberType::Home => "H",
            PhoneNumberType::Mobile => "M",
            PhoneNumberType::Work => "W",
            PhoneNumberType::Fax => "F",
            PhoneNumberType::Other => "O",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Contact {
    pub name: String,
    pub number: String,
    pub number_type: PhoneNumberType,
}

/// One call log row. Names are not stored; they resolve through
/// [`PhonebookQuery::query_contact_by_number`].
#[derive(Clone, Debug, PartialEq)]
pub struct CallEntry {
    pub number: String,
}

/// Read access to contacts and call logs.
pub trait PhonebookQuery {
    /// Reverse lookup of a contact by phone number.
    fn query_contact_by_number(&self, number: &str) -> Option<Contact>;

    /// The most recent entries of one call log, newest first.
    fn query_call_log(&self, log_type: CallLogType, limit: usize) -> Vec<CallEntry>;

    /// Contacts with 1-based indices in the inclusive range.
    fn phonebook_entries(&self, from: usize, to: usize) -> Vec<Contact>;

    fn phonebook_size(&self) -> usize;

    fn call_log_size(&self, log_type: CallLogType) -> usize;
}

/// Responder state for the phonebook related AT commands of one service.
///
/// The selected storage and character set are shared across devices, which
/// matches carkits always reselecting storage before a browse.
pub struct AtPhonebook {
    query: Box<dyn PhonebookQuery + Send>,
    current_storage: PhonebookStorage,
    character_set: String,
}

impl AtPhonebook {
    pub fn new(query: Box<dyn PhonebookQuery + Send>) -> Self {
        AtPhonebook {
            query,
            current_storage: PhonebookStorage::Me,
            character_set: "UTF-8".into(),
        }
    }

    /// Number most recently dialed, for AT+BLDN style redial.
    pub fn last_outgoing_number(&self) -> Option<String> {
        self.query.query_call_log(CallLogType::Outgoing, 1).into_iter().next().map(|entry| entry.number)
    }

    /// AT+CSCS, the character set selection.
    pub fn handle_cscs(&mut self, addr: BDAddr, at: &AtCommand, native: &mut dyn HfpNativeInterface) {
        match at.at_type {
            AtCommandType::Read => {
                native.at_response_string(addr, &format!("+CSCS: \"{}\"", self.character_set));
                native.at_response_ok(addr);
            }
            AtCommandType::Test => {
                native.at_response_string(addr, "+CSCS: (\"UTF-8\",\"IRA\",\"GSM\")");
                native.at_response_ok(addr);
            }
            AtCommandType::Set => {
                let requested = match at.raw_args.as_ref().and_then(|args| args.first()) {
                    Some(arg) => arg.trim_matches('"').to_uppercase(),
                    None => {
                        native.at_response_error(addr, CmeError::AgFailure);
                        return;
                    }
                };
                if SUPPORTED_CHARSETS.contains(&requested.as_str()) {
                    self.character_set = requested;
                    native.at_response_ok(addr);
                } else {
                    native.at_response_error(addr, CmeError::OperationNotSupported);
                }
            }
            AtCommandType::Unknown => {
                native.at_response_error(addr, CmeError::TextHasInvalidChars);
            }
        }
    }

    /// AT+CPBS, the storage selection.
    pub fn handle_cpbs(&mut self, addr: BDAddr, at: &AtCommand, native: &mut dyn HfpNativeInterface) {
        match at.at_type {
            AtCommandType::Read => {
                let used = self.storage_size(self.current_storage);
                native.at_response_string(
                    addr,
                    &format!(
                        "+CPBS: \"{}\",{},{}",
                        self.current_storage.at_name(),
                        used,
                        max_phonebook_size(used)
                    ),
                );
                native.at_response_ok(addr);
            }
            AtCommandType::Test => {
                native.at_response_string(addr, "+CPBS: (\"ME\",\"DC\",\"RC\",\"MC\")");
                native.at_response_ok(addr);
            }
            AtCommandType::Set => {
                let requested = match at.raw_args.as_ref().and_then(|args| args.first()) {
                    Some(arg) => arg,
                    None => {
                        native.at_response_error(addr, CmeError::AgFailure);
                        return;
                    }
                };
                match PhonebookStorage::from_at_name(requested) {
                    Some(storage) => {
                        debug!("[{}]: phonebook storage set to {}", addr, storage.at_name());
                        self.current_storage = storage;
                        native.at_response_ok(addr);
                    }
                    None => {
                        native.at_response_error(addr, CmeError::OperationNotAllowed);
                    }
                }
            }
            AtCommandType::Unknown => {
                native.at_response_error(addr, CmeError::TextHasInvalidChars);
            }
        }
    }

    /// AT+CPBR, the actual browse.
    pub fn handle_cpbr(&mut self, addr: BDAddr, at: &AtCommand, native: &mut dyn HfpNativeInterface) {
        match at.at_type {
            AtCommandType::Test => {
                let size = max_phonebook_size(self.storage_size(self.current_storage));
                native.at_response_string(
                    addr,
                    &format!("+CPBR: (1-{}),{},{}", size, MAX_PHONE_NUMBER_CHARS, MAX_NAME_CHARS),
                );
                native.at_response_ok(addr);
            }
            AtCommandType::Set => {
                let args = match at.raw_args.as_ref().filter(|args| !args.is_empty()) {
                    Some(args) => args,
                    None => {
                        native.at_response_error(addr, CmeError::AgFailure);
                        return;
                    }
                };
                let from = match args[0].parse::<usize>() {
                    Ok(index) => index,
                    Err(_) => {
                        native.at_response_error(addr, CmeError::TextHasInvalidChars);
                        return;
                    }
                };
                let to = match args.get(1) {
                    Some(arg) => match arg.parse::<usize>() {
                        Ok(index) => index,
                        Err(_) => {
                            native.at_response_error(addr, CmeError::TextHasInvalidChars);
                            return;
                        }
                    },
                    None => from,
                };
                if from < 1 || to < from {
                    native.at_response_error(addr, CmeError::InvalidIndex);
                    return;
                }
                self.send_entries(addr, from, to, native);
                native.at_response_ok(addr);
            }
            AtCommandType::Read | AtCommandType::Unknown => {
                native.at_response_error(addr, CmeError::TextHasInvalidChars);
            }
        }
    }

    fn storage_size(&self, storage: PhonebookStorage) -> usize {
        match storage.call_log_type() {
            Some(log_type) => self.query.call_log_size(log_type),
            None => self.query.phonebook_size(),
        }
    }

    fn send_entries(
        &self,
        addr: BDAddr,
        from: usize,
        to: usize,
        native: &mut dyn HfpNativeInterface,
    ) {
        match self.current_storage.call_log_type() {
            None => {
                for (offset, contact) in self.query.phonebook_entries(from, to).iter().enumerate() {
                    let name = format!("{}/{}", contact.name, contact.number_type.suffix());
                    self.send_entry(addr, from + offset, &contact.number, &name, native);
                }
            }
            Some(log_type) => {
                let entries = self.query.query_call_log(log_type, to);
                for (offset, entry) in entries.iter().enumerate().skip(from - 1) {
                    // Call logs store bare numbers; resolve the display name.
                    let name = match self.query.query_contact_by_number(&entry.number) {
                        Some(contact) => {
                            format!("{}/{}", contact.name, contact.number_type.suffix())
                        }
                        None => String::new(),
                    };
                    self.send_entry(addr, offset + 1, &entry.number, &name, native);
                }
            }
        }
    }

    fn send_entry(
        &self,
        addr: BDAddr,
        index: usize,
        number: &str,
        name: &str,
        native: &mut dyn HfpNativeInterface,
    ) {
        let number: String = number.chars().take(MAX_PHONE_NUMBER_CHARS).collect();
        let name = self.clamp_name(name);
        native.at_response_string(
            addr,
            &format!("+CPBR: {},\"{}\",{},\"{}\"", index, number, toa_from_number(&number), name),
        );
    }

    /// Carkits that asked for the GSM alphabet cannot take names longer
    /// than the conversion limit.
    fn clamp_name(&self, name: &str) -> String {
        if self.character_set == "GSM" {
            match name.rsplit_once('/') {
                Some((base, suffix)) if base.chars().count() > MAX_NAME_CHARS_GSM => {
                    let clamped: String = base.chars().take(MAX_NAME_CHARS_GSM).collect();
                    format!("{}/{}", clamped, suffix)
                }
                None if name.chars().count() > MAX_NAME_CHARS_GSM => {
                    name.chars().take(MAX_NAME_CHARS_GSM).collect()
                }
                _ => name.into(),
            }
        } else {
            name.into()
        }
    }
}

fn max_phonebook_size(size: usize) -> usize {
    size.max(1)
}
