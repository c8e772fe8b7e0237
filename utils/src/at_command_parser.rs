//! Parser for AT commands sent by headsets over the service-level connection.
//!
//! The native stack hands us anything it does not consume itself as a raw
//! string. This module classifies the command, splits its arguments and pulls
//! structured data (currently battery levels) out of the vendor commands we
//! understand.

use std::collections::HashMap;

/// Classification of an AT command by its delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommandType {
    /// `<cmd>?` reads the current value.
    Read,
    /// `<cmd>=?` queries the supported values.
    Test,
    /// `<cmd>=<args>` sets a value.
    Set,
    /// Anything else.
    Unknown,
}

/// Structured values extracted from vendor command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtCommandDataType {
    /// Battery level as a percentage, 0 to 100.
    BatteryLevel,
}

const AT_COMMAND_DELIMITER_READ: &str = "?";
const AT_COMMAND_DELIMITER_TEST: &str = "=?";
const AT_COMMAND_DELIMITER_SET: &str = "=";

const APPLE_BATTERY_KEY: &str = "1";
const XEVENT_BATTERY_SUBCOMMAND: &str = "BATTERY";

/// A parsed AT command.
#[derive(Debug, Clone, PartialEq)]
pub struct AtCommand {
    /// The unmodified input.
    pub raw: String,
    pub at_type: AtCommandType,
    /// Command name with the `AT+`/`+` prefix and arguments stripped.
    pub command: String,
    /// Arguments of a Set command, split on commas outside quotes.
    pub raw_args: Option<Vec<String>>,
    /// Vendor associated with the command, if recognized.
    pub vendor: Option<String>,
    /// Structured data extracted from recognized vendor commands.
    pub data: Option<HashMap<AtCommandDataType, String>>,
}

/// Parses a raw AT command string into its parts.
pub fn parse_at_command_data(raw: &str) -> Result<AtCommand, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty at command".into());
    }

    let stripped = trimmed
        .strip_prefix("AT+")
        .or_else(|| trimmed.strip_prefix("+"))
        .unwrap_or(trimmed);

    // Test must be checked before Read and Set; its delimiter contains both.
    let (at_type, command, args_str) = if let Some(command) = stripped.split_once(AT_COMMAND_DELIMITER_TEST).filter(|(_, rest)| rest.is_empty()).map(|(c, _)| c) {
        (AtCommandType::Test, command, None)
    } else if let Some(command) = stripped.strip_suffix(AT_COMMAND_DELIMITER_READ) {
        (AtCommandType::Read, command, None)
    } else if let Some((command, args)) = stripped.split_once(AT_COMMAND_DELIMITER_SET) {
        (AtCommandType::Set, command, Some(args))
    } else {
        (AtCommandType::Unknown, stripped, None)
    };

    if command.is_empty() {
        return Err(format!("at command without a name: {}", raw));
    }

    let raw_args = args_str.map(split_quote_aware);
    let vendor = vendor_for_command(command);
    let data = extract_vendor_data(command, &raw_args)?;

    Ok(AtCommand {
        raw: raw.to_string(),
        at_type,
        command: command.to_string(),
        raw_args,
        vendor,
        data,
    })
}

/// Splits comma separated arguments. Commas inside double quotes do not
/// split; each argument is trimmed of surrounding whitespace.
pub fn split_quote_aware(input: &str) -> Vec<String> {
    if input.trim().is_empty() {
        return vec![];
    }
    let mut args = vec![];
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    args.push(current.trim().to_string());
    args
}

/// Normalizes a freeform AT command: uppercases everything outside double
/// quotes and closes an unbalanced trailing quote.
pub fn normalize_unknown_at(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 1);
    let mut in_quotes = false;
    for c in input.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
            out.push(c);
        } else if in_quotes {
            out.push(c);
        } else {
            out.extend(c.to_uppercase());
        }
    }
    if in_quotes {
        out.push('"');
    }
    out
}

/// Converts a scaled battery reading to a percentage, capped at 100.
pub fn calculate_battery_percent(level: u32, number_of_levels: u32) -> Option<u32> {
    if number_of_levels <= 1 {
        return None;
    }
    Some(std::cmp::min(100, level * 100 / (number_of_levels - 1)))
}

fn vendor_for_command(command: &str) -> Option<String> {
    match command {
        "XAPL" | "IPHONEACCEV" => Some("Apple".into()),
        "XEVENT" => Some("Plantronics".into()),
        _ => None,
    }
}

fn extract_vendor_data(
    command: &str,
    raw_args: &Option<Vec<String>>,
) -> Result<Option<HashMap<AtCommandDataType, String>>, String> {
    let args = match raw_args {
        Some(args) => args,
        None => return Ok(None),
    };
    match command {
        "IPHONEACCEV" => extract_apple_battery(args).map(Some),
        "XEVENT" => extract_xevent_data(args),
        _ => Ok(None),
    }
}

// AT+IPHONEACCEV=<count>,<key1>,<val1>,...; key 1 is the battery level,
// 0 through 9 mapping to 10 through 100 percent.
fn extract_apple_battery(args: &[String]) -> Result<HashMap<AtCommandDataType, String>, String> {
    let claimed = args
        .first()
        .and_then(|a| a.parse::<usize>().ok())
        .ok_or_else(|| "IPHONEACCEV without a pair count".to_string())?;
    if args.len() != claimed * 2 + 1 {
        return Err(format!("IPHONEACCEV claims {} pairs but has {} arguments", claimed, args.len() - 1));
    }
    let mut data = HashMap::new();
    for pair in args[1..].chunks(2) {
        if pair[0] == APPLE_BATTERY_KEY {
            let level = pair[1]
                .parse::<u32>()
                .map_err(|_| format!("bad IPHONEACCEV battery level: {}", pair[1]))?;
            if level > 9 {
                return Err(format!("IPHONEACCEV battery level out of range: {}", level));
            }
            data.insert(AtCommandDataType::BatteryLevel, ((level + 1) * 10).to_string());
        }
    }
    Ok(data)
}

// AT+XEVENT=BATTERY,<level>,<number_of_levels>,...; other subcommands carry
// no data we care about.
fn extract_xevent_data(
    args: &[String],
) -> Result<Option<HashMap<AtCommandDataType, String>>, String> {
    match args.first() {
        Some(sub) if sub.eq_ignore_ascii_case(XEVENT_BATTERY_SUBCOMMAND) => {
            if args.len() < 3 {
                return Err("XEVENT battery without level arguments".into());
            }
            let level = args[1].parse::<u32>().map_err(|_| format!("bad XEVENT level: {}", args[1]))?;
            let levels = args[2].parse::<u32>().map_err(|_| format!("bad XEVENT range: {}", args[2]))?;
            let percent = calculate_battery_percent(level, levels)
                .ok_or_else(|| format!("XEVENT range too small: {}", levels))?;
            let mut data = HashMap::new();
            data.insert(AtCommandDataType::BatteryLevel, percent.to_string());
            Ok(Some(data))
        }
        _ => Ok(None),
    }
}
