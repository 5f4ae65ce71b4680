//! The register map: every reading, setting and mode flag exposed over MQTT.
//!
//! Adding a value to the bridge means adding a line to [`CATALOG`]; nothing else refers to
//! register addresses directly.

use crate::codec::Codec;
use crate::flags::FLAGS;
use std::ops::RangeInclusive;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Reading,
    Setting,
    Flag,
}

impl Category {
    /// The topic path segment values of this category are published under.
    pub fn topic_segment(&self) -> &'static str {
        match self {
            Category::Reading => "readings",
            Category::Setting => "settings",
            Category::Flag => "mode",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub category: Category,
    pub name: &'static str,
    pub address: u16,
    pub codec: Codec,
}

impl Entry {
    pub fn addresses(&self) -> RangeInclusive<u16> {
        self.address..=self.address + (self.codec.width() - 1)
    }

    pub fn is_writable(&self) -> bool {
        self.category == Category::Setting
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagEntry {
    pub name: &'static str,
    pub bit: u8,
    pub writable: bool,
}

pub struct Catalog {
    pub entries: &'static [Entry],
    /// Holding register with the mode flags, see [`crate::flags`].
    pub mode_status_address: u16,
    /// Flags a user may switch. The rest only reflect what the controller is doing.
    pub writable_flags: &'static [&'static str],
}

macro_rules! catalog {
    ($($category: ident $name: literal @ $address: literal: $codec: ident;)*) => {
        &[$(Entry {
            category: Category::$category,
            name: $name,
            address: $address,
            codec: Codec::$codec,
        },)*]
    }
}

/// All supported families share one controller and thus one register map.
pub static CATALOG: Catalog = Catalog {
    entries: catalog! {
        Reading "softwareVersion" @ 5: SoftwareVersion;
        Reading "automationAndHeatingType" @ 7: AutomationType;
        Reading "supplyTemperature" @ 20: Temperature;
        Reading "extractTemperature" @ 21: Temperature;
        Reading "outdoorTemperature" @ 22: Temperature;
        Reading "exhaustTemperature" @ 23: Temperature;
        Reading "supplyFanSpeed" @ 25: Percentage;
        Reading "extractFanSpeed" @ 26: Percentage;
        Reading "supplyFanRpm" @ 27: Rpm;
        Reading "extractFanRpm" @ 28: Rpm;
        Reading "bypassPosition" @ 29: Percentage;
        Reading "heaterOutput" @ 30: Percentage;
        Reading "relativeHumidity" @ 31: Percentage;
        Reading "filterDaysRemaining" @ 32: Count;
        Reading "activeAlarmCount" @ 33: Count;
        Reading "lastAlarm" @ 40: Alarm;
        Setting "normalVentilationLevel" @ 100: Percentage;
        Setting "awayVentilationLevel" @ 101: Percentage;
        Setting "boostVentilationLevel" @ 102: Percentage;
        Setting "nightVentilationLevel" @ 103: Percentage;
        Setting "fireplaceVentilationLevel" @ 104: Percentage;
        Setting "kitchenHoodVentilationLevel" @ 105: Percentage;
        Setting "comfortTemperature" @ 110: Temperature;
        Setting "nightTemperatureOffset" @ 111: Temperature;
        Setting "bypassOpenTemperature" @ 112: Temperature;
        Setting "boostDuration" @ 120: Minutes;
        Setting "fireplaceDuration" @ 121: Minutes;
        Setting "kitchenHoodDuration" @ 122: Minutes;
        Setting "heaterProportionalBand" @ 130: Coefficient;
        Setting "heaterIntegrationTime" @ 131: Coefficient;
    },
    mode_status_address: 10,
    writable_flags: &["away", "boost", "fireplace", "kitchenHood", "night", "holiday", "standby"],
};

impl Catalog {
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn reading(&self, name: &str) -> Option<&Entry> {
        self.find(Category::Reading, name)
    }

    pub fn setting(&self, name: &str) -> Option<&Entry> {
        self.find(Category::Setting, name)
    }

    fn find(&self, category: Category, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.category == category && e.name == name)
    }

    pub fn flags(&self) -> impl Iterator<Item = FlagEntry> + '_ {
        FLAGS.iter().map(|&(bit, name)| FlagEntry {
            name,
            bit,
            writable: self.writable_flags.contains(&name),
        })
    }

    pub fn flag(&self, name: &str) -> Option<FlagEntry> {
        self.flags().find(|f| f.name == name)
    }

    /// Every register address that has to be read for one sync cycle, sorted and deduplicated.
    pub fn addresses(&self) -> Vec<u16> {
        let mut addresses = self.entries.iter().flat_map(Entry::addresses).collect::<Vec<_>>();
        addresses.push(self.mode_status_address);
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// Contiguous ranges that cover [`Self::addresses`], none longer than `max_range_len`.
    ///
    /// Minimizes the number of requests first and the number of registers read second.
    pub fn read_plan(&self, max_range_len: u16) -> Vec<RangeInclusive<u16>> {
        let addresses = self.addresses();
        let n = addresses.len();
        // dp[i] is the (requests, registers) cost of covering addresses[i..].
        let mut dp: Vec<(u32, u64)> = vec![(0, 0); n + 1];
        let mut choices: Vec<usize> = vec![0; n];
        for i in (0..n).rev() {
            let mut best_cost = (u32::MAX, u64::MAX);
            choices[i] = i;
            for j in i..n {
                let range_len = addresses[j] - addresses[i] + 1;
                if range_len > max_range_len {
                    break;
                }
                let rest = dp[j + 1];
                let cost = (rest.0 + 1, rest.1 + u64::from(range_len));
                if cost < best_cost {
                    best_cost = cost;
                    choices[i] = j;
                }
            }
            dp[i] = best_cost;
        }
        let mut ranges = Vec::new();
        if max_range_len == 0 {
            return ranges;
        }
        let mut i = 0;
        while i < n {
            let j = choices[i];
            ranges.push(addresses[i]..=addresses[j]);
            i = j + 1;
        }
        ranges
    }
}
