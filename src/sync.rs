//! Keeps the MQTT-visible state in line with the controller.
//!
//! Every write request is followed by a full read-and-publish cycle, so that side effects of the
//! write on other values (e.g. enabling one mode disabling another) show up too.

use crate::catalog::{Catalog, Category, Entry};
use crate::codec::{DecodeRangeError, ParseError, Value};
use crate::flags::{self, FlagSummary};
use crate::modbus::MAX_SAFE_READ_COUNT;
use crate::topics::{Target, Topics};
use crate::transport::{PubSubTransport, RegisterTransport, TransportError};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use tracing::{debug, info, trace, warn};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read registers {0:?}")]
    Read(RangeInclusive<u16>, #[source] TransportError),
    #[error("could not write `{0}`")]
    Write(String, #[source] TransportError),
    #[error("could not subscribe to `{0}`")]
    Subscribe(String, #[source] TransportError),
    #[error("{} of {total} updates failed: {}", .failures.len(), failed_topics(.failures))]
    Batch { failures: Vec<Failure>, total: usize },
    #[error("write request was rejected")]
    Rejected(#[from] Rejected),
}

/// One topic of a sync cycle that could not be brought up to date.
#[derive(thiserror::Error, Debug)]
pub enum Failure {
    #[error("could not decode the value for `{0}`")]
    Decode(String, #[source] DecodeRangeError),
    #[error("could not publish to `{0}`")]
    Publish(String, #[source] TransportError),
}

impl Failure {
    pub fn topic(&self) -> &str {
        match self {
            Failure::Decode(topic, _) | Failure::Publish(topic, _) => topic,
        }
    }
}

fn failed_topics(failures: &[Failure]) -> String {
    failures.iter().map(Failure::topic).collect::<Vec<_>>().join(", ")
}

/// Write requests that are dropped with a warning rather than failing the caller.
#[derive(thiserror::Error, Debug)]
pub enum Rejected {
    #[error("`{0}` does not name a setting or a mode flag")]
    UnknownTarget(String),
    #[error("`{0}` is not a known setting")]
    UnknownSetting(String),
    #[error(transparent)]
    UnknownFlag(#[from] flags::UnknownFlag),
    #[error("`{0}` is read-only")]
    ReadOnly(String),
    #[error("`{1}` is not a valid value for `{0}`")]
    Payload(String, String, #[source] Option<ParseError>),
}

/// Every catalog value decoded from one pass over the read plan.
pub struct Snapshot<'c> {
    pub values: Vec<(&'c Entry, Result<Value, DecodeRangeError>)>,
    pub flags: FlagSummary,
}

impl Snapshot<'_> {
    /// Topic to payload for every value, plus the values that failed to decode.
    pub fn into_updates(self, topics: &Topics) -> (BTreeMap<String, String>, Vec<Failure>) {
        let mut updates = BTreeMap::new();
        let mut failures = Vec::new();
        for (entry, value) in self.values {
            let topic = topics.state(entry.category, entry.name);
            match value {
                Ok(value) => {
                    updates.insert(topic, value.to_string());
                }
                Err(e) => failures.push(Failure::Decode(topic, e)),
            }
        }
        for (name, set) in self.flags.iter() {
            updates.insert(topics.state(Category::Flag, name), Value::Flag(set).to_string());
        }
        (updates, failures)
    }
}

/// Read and decode every value in `catalog`. Reads are issued one after another.
pub async fn read_snapshot<'c, R: RegisterTransport>(
    registers: &R,
    catalog: &'c Catalog,
) -> Result<Snapshot<'c>, Error> {
    let mut words = BTreeMap::new();
    for range in catalog.read_plan(MAX_SAFE_READ_COUNT) {
        let (start, count) = (*range.start(), range.end() - range.start() + 1);
        trace!(start, count, "reading registers");
        let values =
            registers.read_registers(start, count).await.map_err(|e| Error::Read(range, e))?;
        words.extend((start..).zip(values));
    }
    let mode_address = catalog.mode_status_address;
    let Some(&mode_word) = words.get(&mode_address) else {
        let missing = TransportError::ShortResponse { expected: 1, got: 0 };
        return Err(Error::Read(mode_address..=mode_address, missing));
    };
    let values = catalog
        .entries()
        .map(|entry| {
            let raw = entry.addresses().filter_map(|a| words.get(&a).copied()).collect::<Vec<_>>();
            (entry, entry.codec.decode(&raw))
        })
        .collect();
    Ok(Snapshot { values, flags: flags::decode_flags(mode_word) })
}

enum Write<'c> {
    Setting { entry: &'c Entry, word: u16 },
    Flag { name: &'static str, desired: bool },
}

fn parse_switch(payload: &str) -> Option<bool> {
    match payload.trim() {
        p if p.eq_ignore_ascii_case("ON") => Some(true),
        p if p.eq_ignore_ascii_case("OFF") => Some(false),
        _ => None,
    }
}

pub struct SyncEngine<R, P> {
    registers: R,
    pubsub: P,
    catalog: &'static Catalog,
    topics: Topics,
    /// Held for the whole of a write and its trailing publish, and for standalone publishes.
    busy: tokio::sync::Mutex<()>,
}

impl<R: RegisterTransport, P: PubSubTransport> SyncEngine<R, P> {
    pub fn new(registers: R, pubsub: P, catalog: &'static Catalog, topics: Topics) -> Self {
        Self { registers, pubsub, catalog, topics, busy: tokio::sync::Mutex::new(()) }
    }

    pub fn registers(&self) -> &R {
        &self.registers
    }

    pub fn pubsub(&self) -> &P {
        &self.pubsub
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Read everything and publish it, together with the `online` status.
    ///
    /// Publishing continues past individual failures, which are reported together at the end.
    pub async fn publish_all(&self) -> Result<(), Error> {
        let _busy = self.busy.lock().await;
        self.publish_all_exclusive().await
    }

    async fn publish_all_exclusive(&self) -> Result<(), Error> {
        let snapshot = read_snapshot(&self.registers, self.catalog).await?;
        let (mut updates, mut failures) = snapshot.into_updates(&self.topics);
        updates.insert(self.topics.status(), ONLINE.to_string());
        let total = updates.len() + failures.len();
        let publishes = updates.iter().map(|(topic, payload)| async move {
            (topic, self.pubsub.publish(topic, payload).await)
        });
        for (topic, result) in futures::future::join_all(publishes).await {
            if let Err(e) = result {
                failures.push(Failure::Publish(topic.clone(), e));
            }
        }
        debug!(total, failed = failures.len(), "sync cycle published");
        if failures.is_empty() { Ok(()) } else { Err(Error::Batch { failures, total }) }
    }

    /// Carry out a write request such as `settings/awayVentilationLevel` = `55`, then republish.
    ///
    /// Requests for unknown or read-only targets and unparsable payloads are logged and skipped;
    /// the republish still happens. A failed register write is returned without republishing.
    pub async fn apply_write(&self, target: &str, payload: &str) -> Result<(), Error> {
        let _busy = self.busy.lock().await;
        match self.write(target, payload).await {
            Ok(()) => {}
            Err(Error::Rejected(e)) => {
                warn!(
                    message = "ignoring write request",
                    write_target = target,
                    payload,
                    error = (&e as &dyn std::error::Error)
                );
            }
            Err(e) => return Err(e),
        }
        self.publish_all_exclusive().await
    }

    async fn write(&self, target: &str, payload: &str) -> Result<(), Error> {
        match self.resolve(target, payload)? {
            Write::Setting { entry, word } => {
                info!(setting = entry.name, address = entry.address, word, "writing setting");
                self.registers
                    .write_register(entry.address, word)
                    .await
                    .map_err(|e| Error::Write(target.to_string(), e))
            }
            Write::Flag { name, desired } => {
                let address = self.catalog.mode_status_address;
                let current = self
                    .registers
                    .read_register(address)
                    .await
                    .map_err(|e| Error::Write(target.to_string(), e))?;
                let updated = flags::set_flag(current, name, desired).map_err(Rejected::from)?;
                info!(flag = name, desired, current, updated, "writing mode status");
                self.registers
                    .write_register(address, updated)
                    .await
                    .map_err(|e| Error::Write(target.to_string(), e))
            }
        }
    }

    fn resolve(&self, target: &str, payload: &str) -> Result<Write<'static>, Rejected> {
        let parsed = Target::parse(target).ok_or_else(|| Rejected::UnknownTarget(target.into()))?;
        let invalid = |cause| Rejected::Payload(target.to_string(), payload.to_string(), cause);
        match parsed.category {
            Category::Setting => {
                let entry = self
                    .catalog
                    .setting(parsed.name)
                    .ok_or_else(|| Rejected::UnknownSetting(parsed.name.to_string()))?;
                let value = entry.codec.parse(payload).map_err(|e| invalid(Some(e)))?;
                let word = entry.codec.encode(&value).ok_or_else(|| invalid(None))?;
                Ok(Write::Setting { entry, word })
            }
            Category::Flag => {
                let flag = self
                    .catalog
                    .flag(parsed.name)
                    .ok_or_else(|| flags::UnknownFlag(parsed.name.to_string()))?;
                if !flag.writable {
                    return Err(Rejected::ReadOnly(target.to_string()));
                }
                let desired = parse_switch(payload).ok_or_else(|| invalid(None))?;
                Ok(Write::Flag { name: flag.name, desired })
            }
            Category::Reading => Err(Rejected::ReadOnly(target.to_string())),
        }
    }

    pub async fn subscribe_for_writes(&self) -> Result<(), Error> {
        for filter in self.topics.command_filters() {
            debug!(%filter, "subscribing");
            self.pubsub.subscribe(&filter).await.map_err(|e| Error::Subscribe(filter, e))?;
        }
        Ok(())
    }

    /// Dispatch one inbound message. Messages on topics other than our command topics are ignored.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let Some(target) = self.topics.parse_command(topic) else {
            trace!(topic, "ignoring message on a non-command topic");
            return Ok(());
        };
        let Ok(payload) = std::str::from_utf8(payload) else {
            warn!(topic, "ignoring write request with a payload that is not UTF-8");
            return self.publish_all().await;
        };
        self.apply_write(&target.to_string(), payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CATALOG;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockRegisters {
        words: Mutex<BTreeMap<u16, u16>>,
        writes: Mutex<Vec<(u16, u16)>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl MockRegisters {
        fn seeded() -> Self {
            let registers = Self::default();
            {
                let mut words = registers.words.lock().unwrap();
                for entry in CATALOG.entries() {
                    for address in entry.addresses() {
                        words.insert(address, 0);
                    }
                }
                words.insert(20, 171);
                words.insert(22, 65486);
                words.insert(101, 30);
                words.insert(CATALOG.mode_status_address, 1);
                for (address, word) in (40..).zip([10, 2, 22, 1, 21, 13, 45]) {
                    words.insert(address, word);
                }
            }
            registers
        }

        fn word(&self, address: u16) -> u16 {
            self.words.lock().unwrap().get(&address).copied().unwrap_or_default()
        }

        fn writes(&self) -> Vec<(u16, u16)> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl RegisterTransport for MockRegisters {
        async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
            tokio::task::yield_now().await;
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            let words = self.words.lock().unwrap();
            let range = address..address + count;
            Ok(range.map(|a| words.get(&a).copied().unwrap_or_default()).collect())
        }

        async fn write_register(&self, address: u16, value: u16) -> Result<(), TransportError> {
            tokio::task::yield_now().await;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::Exception(2));
            }
            self.words.lock().unwrap().insert(address, value);
            self.writes.lock().unwrap().push((address, value));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockPubSub {
        retained: Mutex<BTreeMap<String, String>>,
        publish_count: Mutex<usize>,
        subscriptions: Mutex<Vec<String>>,
        failing_topic: Option<String>,
    }

    impl MockPubSub {
        fn retained(&self) -> BTreeMap<String, String> {
            self.retained.lock().unwrap().clone()
        }

        fn get(&self, topic: &str) -> Option<String> {
            self.retained.lock().unwrap().get(topic).cloned()
        }

        fn publish_count(&self) -> usize {
            *self.publish_count.lock().unwrap()
        }
    }

    impl PubSubTransport for MockPubSub {
        async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
            tokio::task::yield_now().await;
            *self.publish_count.lock().unwrap() += 1;
            if self.failing_topic.as_deref() == Some(topic) {
                return Err(TransportError::Disconnected);
            }
            self.retained.lock().unwrap().insert(topic.to_string(), payload.to_string());
            Ok(())
        }

        async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
            self.subscriptions.lock().unwrap().push(pattern.to_string());
            Ok(())
        }
    }

    fn engine(pubsub: MockPubSub) -> SyncEngine<MockRegisters, MockPubSub> {
        SyncEngine::new(MockRegisters::seeded(), pubsub, &CATALOG, Topics::new("r/x"))
    }

    fn topic_count() -> usize {
        CATALOG.entries().count() + CATALOG.flags().count() + 1
    }

    #[tokio::test]
    async fn publishes_every_value() {
        let engine = engine(MockPubSub::default());
        engine.publish_all().await.unwrap();
        let retained = engine.pubsub().retained();
        assert_eq!(retained.len(), topic_count());
        assert_eq!(retained["r/x/status"], "online");
        assert_eq!(retained["r/x/readings/supplyTemperature"], "17.1");
        assert_eq!(retained["r/x/readings/outdoorTemperature"], "-5.0");
        assert_eq!(retained["r/x/settings/awayVentilationLevel"], "30");
        assert_eq!(retained["r/x/mode/normal"], "ON");
        assert_eq!(retained["r/x/mode/away"], "OFF");
        assert!(retained["r/x/readings/lastAlarm"].contains("2022-01-21T13:45:00"));
        assert!(engine.registers().writes().is_empty());
    }

    #[tokio::test]
    async fn setting_write_is_followed_by_full_republish() {
        let engine = engine(MockPubSub::default());
        engine.publish_all().await.unwrap();
        let mut before = engine.pubsub().retained();

        engine.apply_write("settings/awayVentilationLevel", "55").await.unwrap();
        assert_eq!(engine.registers().writes(), vec![(101, 55)]);
        assert_eq!(engine.pubsub().publish_count(), 2 * topic_count());

        let mut after = engine.pubsub().retained();
        assert_eq!(after.remove("r/x/settings/awayVentilationLevel").as_deref(), Some("55"));
        before.remove("r/x/settings/awayVentilationLevel");
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn temperature_setting_write() {
        let engine = engine(MockPubSub::default());
        engine.apply_write("settings/comfortTemperature", "21.5").await.unwrap();
        assert_eq!(engine.registers().word(110), 215);
        assert_eq!(engine.pubsub().get("r/x/settings/comfortTemperature").as_deref(), Some("21.5"));
    }

    #[tokio::test]
    async fn flag_write_touches_only_its_bit() {
        let engine = engine(MockPubSub::default());
        engine.apply_write("mode/away", "ON").await.unwrap();
        assert_eq!(engine.registers().word(CATALOG.mode_status_address), 0b11);
        assert_eq!(engine.pubsub().get("r/x/mode/away").as_deref(), Some("ON"));
        assert_eq!(engine.pubsub().get("r/x/mode/normal").as_deref(), Some("ON"));

        engine.apply_write("mode/away", "off").await.unwrap();
        assert_eq!(engine.registers().word(CATALOG.mode_status_address), 0b1);
        assert_eq!(engine.pubsub().get("r/x/mode/away").as_deref(), Some("OFF"));
    }

    #[tokio::test]
    async fn rejected_writes_still_republish() {
        for (target, payload) in [
            ("settings/bogus", "1"),
            ("mode/turbo", "ON"),
            ("mode/filterAlarm", "OFF"),
            ("readings/supplyTemperature", "20"),
            ("settings/awayVentilationLevel", "lots"),
            ("settings/awayVentilationLevel", "-3"),
            ("mode/away", "maybe"),
            ("nonsense", "1"),
        ] {
            let engine = engine(MockPubSub::default());
            engine.apply_write(target, payload).await.unwrap();
            assert!(engine.registers().writes().is_empty(), "{target} = {payload}");
            assert_eq!(engine.pubsub().retained().len(), topic_count(), "{target} = {payload}");
        }
    }

    #[test]
    fn rejection_reasons() {
        let engine = engine(MockPubSub::default());
        assert!(matches!(engine.resolve("settings/bogus", "1"), Err(Rejected::UnknownSetting(_))));
        assert!(matches!(engine.resolve("mode/turbo", "ON"), Err(Rejected::UnknownFlag(_))));
        assert!(matches!(engine.resolve("mode/defrost", "ON"), Err(Rejected::ReadOnly(_))));
        assert!(matches!(
            engine.resolve("settings/boostDuration", "x"),
            Err(Rejected::Payload(_, _, Some(ParseError::NotANumber(_))))
        ));
        assert!(matches!(engine.resolve("status", "online"), Err(Rejected::UnknownTarget(_))));
    }

    #[tokio::test]
    async fn failed_write_skips_republish() {
        let engine = engine(MockPubSub::default());
        engine.registers().fail_writes.store(true, Ordering::SeqCst);
        let err = engine.apply_write("settings/boostDuration", "30").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Write(target, TransportError::Exception(2)) if target == "settings/boostDuration"
        ));
        assert_eq!(engine.pubsub().publish_count(), 0);
    }

    #[tokio::test]
    async fn failed_read_aborts_cycle() {
        let engine = engine(MockPubSub::default());
        engine.registers().fail_reads.store(true, Ordering::SeqCst);
        assert!(matches!(engine.publish_all().await, Err(Error::Read(..))));
        assert_eq!(engine.pubsub().publish_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_the_batch() {
        let failing = "r/x/readings/supplyTemperature";
        let engine = engine(MockPubSub { failing_topic: Some(failing.into()), ..Default::default() });
        let Err(Error::Batch { failures, total }) = engine.publish_all().await else {
            panic!("expected a batch error");
        };
        assert_eq!(total, topic_count());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].topic(), failing);
        let retained = engine.pubsub().retained();
        assert_eq!(retained.len(), topic_count() - 1);
        assert!(!retained.contains_key(failing));
    }

    #[tokio::test]
    async fn decode_failure_is_reported_after_publishing_the_rest() {
        let engine = engine(MockPubSub::default());
        // Month 13.
        engine.registers().words.lock().unwrap().insert(43, 13);
        let Err(Error::Batch { failures, total }) = engine.publish_all().await else {
            panic!("expected a batch error");
        };
        assert_eq!(total, topic_count());
        assert!(matches!(
            &failures[..],
            [Failure::Decode(topic, _)] if topic == "r/x/readings/lastAlarm"
        ));
        assert_eq!(engine.pubsub().retained().len(), topic_count() - 1);
    }

    #[tokio::test]
    async fn concurrent_flag_writes_are_serialized() {
        let engine = engine(MockPubSub::default());
        let (a, b) = tokio::join!(
            engine.apply_write("mode/away", "ON"),
            engine.apply_write("mode/night", "ON")
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(engine.registers().word(CATALOG.mode_status_address), 0b10_0011);
    }

    #[tokio::test]
    async fn subscribes_to_command_topics() {
        let engine = engine(MockPubSub::default());
        engine.subscribe_for_writes().await.unwrap();
        assert_eq!(
            *engine.pubsub().subscriptions.lock().unwrap(),
            vec!["r/x/settings/+/set".to_string(), "r/x/mode/+/set".to_string()]
        );
    }

    #[tokio::test]
    async fn dispatches_inbound_messages() {
        let engine = engine(MockPubSub::default());
        engine.handle_message("r/x/settings/boostDuration/set", b"45").await.unwrap();
        assert_eq!(engine.registers().writes(), vec![(120, 45)]);
        assert_eq!(engine.pubsub().publish_count(), topic_count());

        engine.handle_message("r/x/settings/boostDuration", b"50").await.unwrap();
        engine.handle_message("homeassistant/status", b"online").await.unwrap();
        assert_eq!(engine.registers().writes(), vec![(120, 45)]);
        assert_eq!(engine.pubsub().publish_count(), topic_count());
    }

    #[tokio::test]
    async fn undecodable_payload_still_republishes() {
        let engine = engine(MockPubSub::default());
        engine.handle_message("r/x/mode/away/set", &[0xFF, 0xFE]).await.unwrap();
        assert!(engine.registers().writes().is_empty());
        assert_eq!(engine.pubsub().publish_count(), topic_count());
        engine.handle_message("r/x/mode/away/set", b"maybe").await.unwrap();
        assert!(engine.registers().writes().is_empty());
        assert_eq!(engine.pubsub().publish_count(), 2 * topic_count());
    }
}
