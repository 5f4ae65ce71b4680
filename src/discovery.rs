//! Entity descriptors for home automation discovery.
//!
//! One retained JSON document per reading, setting and flag, published under
//! `<discovery prefix>/<component>/<device key>/<name>/config`.

use crate::catalog::{Catalog, Category};
use crate::identity::{self, DeviceIdentity};
use crate::topics::Topics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Sensor,
    Number,
    Switch,
    BinarySensor,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceBlock {
    pub identifiers: Vec<String>,
    pub name: String,
    pub sw_version: String,
    pub model: String,
    pub manufacturer: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct EntityDescriptor {
    #[serde(skip)]
    pub component: Component,
    #[serde(skip)]
    pub object_id: &'static str,
    pub unique_id: String,
    pub name: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    pub device: DeviceBlock,
}

impl EntityDescriptor {
    pub fn config_topic(&self, discovery_prefix: &str, device_key: &str) -> String {
        format!(
            "{}/{}/{device_key}/{}/config",
            discovery_prefix.trim_end_matches('/'),
            self.component,
            self.object_id
        )
    }
}

/// `awayVentilationLevel` becomes `Away ventilation level`.
fn display_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if i == 0 {
            result.extend(c.to_uppercase());
        } else if c.is_ascii_uppercase() {
            result.push(' ');
            result.push(c.to_ascii_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

pub fn device_block(identity: &DeviceIdentity, manufacturer: &str) -> DeviceBlock {
    let model = identity::model_name(identity);
    DeviceBlock {
        identifiers: vec![identity::device_key(identity)],
        name: model.clone(),
        sw_version: identity.software_version.clone(),
        model,
        manufacturer: manufacturer.to_string(),
    }
}

/// A descriptor for every value in `catalog`.
pub fn descriptors(
    catalog: &Catalog,
    identity: &DeviceIdentity,
    topics: &Topics,
    manufacturer: &str,
) -> Vec<EntityDescriptor> {
    let device = device_block(identity, manufacturer);
    let device_key = identity::device_key(identity);
    let describe = |category: Category, name: &'static str, component: Component| {
        let writable = matches!(component, Component::Number | Component::Switch);
        EntityDescriptor {
            component,
            object_id: name,
            unique_id: format!("{device_key}_{}_{name}", category.topic_segment()),
            name: display_name(name),
            state_topic: topics.state(category, name),
            command_topic: writable.then(|| topics.command(category, name)),
            availability_topic: topics.status(),
            unit_of_measurement: None,
            device_class: None,
            step: None,
            device: device.clone(),
        }
    };
    let mut result = Vec::new();
    for entry in catalog.entries() {
        let component = match entry.category {
            Category::Setting => Component::Number,
            Category::Reading | Category::Flag => Component::Sensor,
        };
        let mut descriptor = describe(entry.category, entry.name, component);
        descriptor.unit_of_measurement = entry.codec.unit();
        descriptor.device_class = entry.codec.device_class();
        if component == Component::Number {
            descriptor.step = Some(match entry.codec {
                crate::codec::Codec::Temperature => 0.1,
                _ => 1.0,
            });
        }
        result.push(descriptor);
    }
    for flag in catalog.flags() {
        let component = if flag.writable { Component::Switch } else { Component::BinarySensor };
        result.push(describe(Category::Flag, flag.name, component));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CATALOG;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_words([0, 1, 1, 0, 2, 14])
    }

    fn all() -> Vec<EntityDescriptor> {
        descriptors(&CATALOG, &identity(), &Topics::new("recuperator/pingvin_ec"), "Salda")
    }

    fn find(name: &str, component: Component) -> EntityDescriptor {
        all().into_iter().find(|d| d.object_id == name && d.component == component).unwrap()
    }

    #[test]
    fn one_descriptor_per_value() {
        let all = all();
        assert_eq!(all.len(), CATALOG.entries().count() + CATALOG.flags().count());
        let mut ids = all.iter().map(|d| d.unique_id.as_str()).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), all.len());
    }

    #[test]
    fn setting_is_a_number() {
        let d = find("awayVentilationLevel", Component::Number);
        assert_eq!(d.name, "Away ventilation level");
        assert_eq!(d.unique_id, "pingvin_ec_settings_awayVentilationLevel");
        assert_eq!(d.state_topic, "recuperator/pingvin_ec/settings/awayVentilationLevel");
        assert_eq!(
            d.command_topic.as_deref(),
            Some("recuperator/pingvin_ec/settings/awayVentilationLevel/set")
        );
        assert_eq!(d.unit_of_measurement, Some("%"));
        assert_eq!(
            d.config_topic("homeassistant/", "pingvin_ec"),
            "homeassistant/number/pingvin_ec/awayVentilationLevel/config"
        );
    }

    #[test]
    fn flags_are_switches_or_binary_sensors() {
        let away = find("away", Component::Switch);
        assert_eq!(away.command_topic.as_deref(), Some("recuperator/pingvin_ec/mode/away/set"));
        let defrost = find("defrost", Component::BinarySensor);
        assert_eq!(defrost.command_topic, None);
        assert_eq!(
            defrost.config_topic("homeassistant", "pingvin_ec"),
            "homeassistant/binary_sensor/pingvin_ec/defrost/config"
        );
    }

    #[test]
    fn serializes_device_block_and_skips_missing_fields() {
        let d = find("supplyTemperature", Component::Sensor);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["device_class"], "temperature");
        assert_eq!(json["unit_of_measurement"], "°C");
        assert_eq!(json["availability_topic"], "recuperator/pingvin_ec/status");
        assert!(json.get("command_topic").is_none());
        assert!(json.get("component").is_none());
        assert_eq!(
            json["device"],
            serde_json::json!({
                "identifiers": ["pingvin_ec"],
                "name": "Pingvin eco EDE",
                "sw_version": "2.14",
                "model": "Pingvin eco EDE",
                "manufacturer": "Salda",
            })
        );
    }
}
