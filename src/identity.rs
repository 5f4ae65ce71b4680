//! Which unit we are talking to.
//!
//! The controller reports its family, fan, heating and cooling types as small integer codes in a
//! block of holding registers. These are turned into a display model name (e.g. `Pegasus eco EDE -
//! CG`) and a device key that is safe to use inside topic paths and entity identifiers.

use crate::transport::{RegisterTransport, TransportError};
use num_traits::FromPrimitive as _;

/// First register of the identity block: family, fan, heating, cooling, version major, minor.
pub const IDENTITY_ADDRESS: u16 = 1;
pub const IDENTITY_LENGTH: u16 = 6;

pub const UNKNOWN: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive, strum::IntoStaticStr)]
#[repr(u16)]
pub enum Family {
    Pingvin = 0,
    Pegasus = 1,
    Pandion = 2,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive, strum::IntoStaticStr)]
#[repr(u16)]
pub enum FanType {
    AC = 0,
    EC = 1,
}

/// Code 0 means no heater is installed.
static HEATING_TYPES: &[(u16, &str)] = &[(1, "EDE"), (2, "EDW")];
/// Code 0 means no cooler is installed.
static COOLING_TYPES: &[(u16, &str)] = &[(1, "CG"), (2, "CW")];
static AUTOMATION_AND_HEATING_TYPES: &[(u16, &str)] =
    &[(0, "ED/MD"), (1, "EDW/MDW"), (2, "EDEW/MDEW"), (3, "EDE/MDE")];

fn lookup(table: &'static [(u16, &'static str)], code: u16) -> Option<&'static str> {
    table.iter().find(|(c, _)| *c == code).map(|(_, name)| *name)
}

pub fn family_name(code: u16) -> &'static str {
    Family::from_u16(code).map(<&str>::from).unwrap_or(UNKNOWN)
}

pub fn fan_type_name(code: u16) -> &'static str {
    FanType::from_u16(code).map(<&str>::from).unwrap_or(UNKNOWN)
}

fn installed(table: &'static [(u16, &'static str)], code: u16) -> Option<String> {
    if code == 0 {
        return None;
    }
    Some(lookup(table, code).unwrap_or(UNKNOWN).to_string())
}

pub fn automation_and_heating_type_name(code: u16) -> &'static str {
    lookup(AUTOMATION_AND_HEATING_TYPES, code).unwrap_or(UNKNOWN)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub family_type: u16,
    pub fan_type: u16,
    pub heating_type_installed: Option<String>,
    pub cooling_type_installed: Option<String>,
    pub software_version: String,
}

impl DeviceIdentity {
    pub fn from_words(words: [u16; IDENTITY_LENGTH as usize]) -> Self {
        let [family, fan, heating, cooling, major, minor] = words;
        Self {
            family_type: family,
            fan_type: fan,
            heating_type_installed: installed(HEATING_TYPES, heating),
            cooling_type_installed: installed(COOLING_TYPES, cooling),
            software_version: format!("{major}.{minor}"),
        }
    }
}

/// Read the identity block. Done once per connection.
pub async fn read_identity<R: RegisterTransport>(
    registers: &R,
) -> Result<DeviceIdentity, TransportError> {
    let words = registers.read_registers(IDENTITY_ADDRESS, IDENTITY_LENGTH).await?;
    let words = <[u16; IDENTITY_LENGTH as usize]>::try_from(words.as_slice()).map_err(|_| {
        TransportError::ShortResponse { expected: IDENTITY_LENGTH, got: words.len() }
    })?;
    let identity = DeviceIdentity::from_words(words);
    tracing::debug!(?identity, model = model_name(&identity), "resolved device identity");
    Ok(identity)
}

pub fn model_name(identity: &DeviceIdentity) -> String {
    let mut name = family_name(identity.family_type).to_string();
    if fan_type_name(identity.fan_type) == "EC" {
        name.push_str(" eco");
    }
    // FIXME: cooling only ever showed up next to a heater on the units seen so far; confirm the
    // formatting for a cooling-only unit.
    if let Some(heating) = &identity.heating_type_installed {
        name.push(' ');
        name.push_str(heating);
        if let Some(cooling) = &identity.cooling_type_installed {
            name.push_str(" - ");
            name.push_str(cooling);
        }
    }
    name
}

/// A lowercase `family_fan` key made only of `[a-z0-9_]`.
pub fn device_key(identity: &DeviceIdentity) -> String {
    let raw = format!("{}_{}", family_name(identity.family_type), fan_type_name(identity.fan_type));
    raw.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .collect()
}
