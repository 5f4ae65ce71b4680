fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod registers {
    use crate::catalog::{CATALOG, Catalog};
    use crate::output;

    /// Search and output the values known to the bridge.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list values whose name, category or address contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register map")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub category: &'static str,
        pub name: &'static str,
        pub address: u16,
        pub width: u16,
        pub bit: Option<u8>,
        pub writable: bool,
        pub codec: &'static str,
        pub unit: Option<&'static str>,
    }

    impl RegisterSchema {
        pub fn all(catalog: &Catalog) -> impl Iterator<Item = Self> + '_ {
            let entries = catalog.entries().map(|entry| RegisterSchema {
                category: entry.category.topic_segment(),
                name: entry.name,
                address: entry.address,
                width: entry.codec.width(),
                bit: None,
                writable: entry.is_writable(),
                codec: entry.codec.into(),
                unit: entry.codec.unit(),
            });
            let flags = catalog.flags().map(|flag| RegisterSchema {
                category: crate::catalog::Category::Flag.topic_segment(),
                name: flag.name,
                address: catalog.mode_status_address,
                width: 1,
                bit: Some(flag.bit),
                writable: flag.writable,
                codec: "flag",
                unit: None,
            });
            entries.chain(flags)
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.name.to_lowercase().contains(&pattern)
                || self.category.contains(&pattern)
                || self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(vec![
            "Category", "Name", "Address", "Width", "Bit", "Access", "Codec", "Unit",
        ])?;
        for register in RegisterSchema::all(&CATALOG) {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        register.category.to_string(),
                        register.name.to_string(),
                        register.address.to_string(),
                        register.width.to_string(),
                        register.bit.map(|b| b.to_string()).unwrap_or_default(),
                        if register.writable { "RW".to_string() } else { "R".to_string() },
                        register.codec.to_string(),
                        register.unit.unwrap_or_default().to_string(),
                    ]
                },
                || &register,
            )?;
        }
        Ok(output.commit()?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn lists_entries_and_flags() {
            let all = RegisterSchema::all(&CATALOG).collect::<Vec<_>>();
            assert_eq!(all.len(), CATALOG.entries().count() + CATALOG.flags().count());
            let away = all.iter().find(|r| r.category == "mode" && r.name == "away").unwrap();
            assert_eq!((away.address, away.bit, away.writable), (10, Some(1), true));
            let alarm = all.iter().find(|r| r.name == "lastAlarm").unwrap();
            assert_eq!((alarm.width, alarm.codec), (7, "alarm"));
        }

        #[test]
        fn filters() {
            let matching = |pattern: &str| {
                RegisterSchema::all(&CATALOG).filter(|r| r.is_match(pattern)).count()
            };
            assert_eq!(matching("supplytemp"), 1);
            assert_eq!(matching("MODE"), CATALOG.flags().count());
            assert!(matching("ventilation") >= 6);
            assert_eq!(matching("no such thing"), 0);
        }
    }
}

pub mod read {
    use crate::catalog::{CATALOG, Category};
    use crate::codec::Value;
    use crate::connection::{self, Connection};
    use crate::identity;
    use crate::output;
    use crate::sync;
    use crate::transport::TransportError;
    use tracing::warn;

    /// Read every value from the unit once and print it.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the modbus connection")]
        Connect(#[source] connection::Error),
        #[error("could not read the device identity")]
        Identity(#[source] TransportError),
        #[error("could not read the values")]
        Read(#[source] sync::Error),
        #[error("could not output the values")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Row<'a> {
        category: &'a str,
        name: &'a str,
        value: Value,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(run_async(args))
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let identity = identity::read_identity(&connection).await.map_err(Error::Identity)?;
        let snapshot = sync::read_snapshot(&connection, &CATALOG).await.map_err(Error::Read)?;

        output.table_headers(vec!["Category", "Name", "Value"])?;
        let device = [
            ("model", identity::model_name(&identity)),
            ("key", identity::device_key(&identity)),
            ("softwareVersion", identity.software_version.clone()),
            ("heatingType", identity.heating_type_installed.clone().unwrap_or_default()),
            ("coolingType", identity.cooling_type_installed.clone().unwrap_or_default()),
        ];
        for (name, value) in device {
            emit(&mut output, "device", name, Value::Text(value))?;
        }
        for (entry, value) in snapshot.values {
            match value {
                Ok(value) => emit(&mut output, entry.category.topic_segment(), entry.name, value)?,
                Err(e) => warn!(
                    message = "could not decode",
                    entry = entry.name,
                    error = (&e as &dyn std::error::Error)
                ),
            }
        }
        for (name, set) in snapshot.flags.iter() {
            emit(&mut output, Category::Flag.topic_segment(), name, Value::Flag(set))?;
        }
        Ok(output.commit()?)
    }

    fn emit(
        output: &mut output::Output,
        category: &str,
        name: &str,
        value: Value,
    ) -> Result<(), output::Error> {
        output.result(
            || vec![category.to_string(), name.to_string(), value.to_string()],
            || Row { category, name, value: value.clone() },
        )
    }
}

pub mod bridge {
    use crate::catalog::CATALOG;
    use crate::connection::{self, Connection};
    use crate::discovery;
    use crate::identity;
    use crate::sync::{self, SyncEngine};
    use crate::topics::Topics;
    use crate::transport::{PubSubTransport, TransportError};
    use rumqttc::v5::mqttbytes::QoS;
    use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
    use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
    use tokio_stream::StreamExt as _;
    use tokio_stream::wrappers::{IntervalStream, UnboundedReceiverStream};
    use tokio_util::task::AbortOnDropHandle;
    use tracing::{debug, info, trace, warn};

    /// Mirror the unit onto an MQTT broker and carry out write requests sent to it.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// MQTT broker to connect to, e.g. `mqtt://localhost:1883?client_id=recuperator`.
        #[arg(long)]
        mqtt: String,

        /// Topic all values are published under. Defaults to `recuperator/<device key>`.
        #[arg(long)]
        topic_prefix: Option<String>,

        /// Topic prefix home automation discovery documents are published under.
        #[arg(long, default_value = "homeassistant")]
        discovery_prefix: String,

        /// Manufacturer reported in the discovery documents.
        #[arg(long, default_value = "unknown")]
        manufacturer: String,

        /// How often all values are read from the unit and published.
        #[arg(long, default_value = "30s")]
        poll_interval: humantime::Duration,

        /// How long to wait before reconnecting after the MQTT connection failed.
        #[arg(long, default_value = "5s")]
        mqtt_reconnect_delay: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not set up the modbus connection")]
        Connect(#[source] connection::Error),
        #[error("could not read the device identity")]
        Identity(#[source] TransportError),
        #[error("could not parse the MQTT broker URL")]
        MqttOptions(#[source] rumqttc::v5::OptionError),
        #[error("could not serialize the discovery document for `{1}`")]
        SerializeDiscovery(#[source] serde_json::Error, String),
        #[error("could not publish the discovery document to `{1}`")]
        PublishDiscovery(#[source] TransportError, String),
        #[error("could not subscribe to write requests")]
        Subscribe(#[source] sync::Error),
        #[error("the MQTT event loop stopped")]
        EventLoopEnded,
    }

    enum MqttEvent {
        Connected,
        Disconnected,
        Message { topic: String, payload: Vec<u8> },
    }

    enum Tick {
        Poll,
        Mqtt(MqttEvent),
    }

    fn mqtt_events(
        mut eventloop: EventLoop,
        reconnect_delay: std::time::Duration,
    ) -> impl futures::Stream<Item = MqttEvent> {
        async_stream::stream! {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => yield MqttEvent::Connected,
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(topic) = std::str::from_utf8(&publish.topic) else {
                            warn!(topic = ?publish.topic, "ignoring a message with a non UTF-8 topic");
                            continue;
                        };
                        yield MqttEvent::Message {
                            topic: topic.to_string(),
                            payload: publish.payload.to_vec(),
                        };
                    }
                    Ok(event) => trace!(?event, "mqtt event"),
                    Err(e) => {
                        warn!(message = "mqtt connection failed", error = (&e as &dyn std::error::Error));
                        yield MqttEvent::Disconnected;
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(run_async(args))
    }

    async fn publish_discovery(
        engine: &SyncEngine<Connection, AsyncClient>,
        identity: &identity::DeviceIdentity,
        args: &Args,
    ) -> Result<(), Error> {
        let device_key = identity::device_key(identity);
        let descriptors =
            discovery::descriptors(&CATALOG, identity, engine.topics(), &args.manufacturer);
        for descriptor in descriptors {
            let topic = descriptor.config_topic(&args.discovery_prefix, &device_key);
            let document = serde_json::to_string(&descriptor)
                .map_err(|e| Error::SerializeDiscovery(e, topic.clone()))?;
            PubSubTransport::publish(engine.pubsub(), &topic, &document)
                .await
                .map_err(|e| Error::PublishDiscovery(e, topic))?;
        }
        Ok(())
    }

    async fn run_async(args: Args) -> Result<(), Error> {
        let connection = Connection::new(args.connection.clone()).await.map_err(Error::Connect)?;
        let identity = identity::read_identity(&connection).await.map_err(Error::Identity)?;
        let device_key = identity::device_key(&identity);
        info!(model = %identity::model_name(&identity), %device_key, "found the unit");
        let prefix =
            args.topic_prefix.clone().unwrap_or_else(|| format!("recuperator/{device_key}"));
        let topics = Topics::new(&prefix);

        let mut options = MqttOptions::parse_url(&args.mqtt).map_err(Error::MqttOptions)?;
        options.set_last_will(LastWill::new(
            topics.status(),
            sync::OFFLINE,
            QoS::AtLeastOnce,
            true,
            None,
        ));
        let (client, eventloop) = AsyncClient::new(options, 128);
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let reconnect_delay = *args.mqtt_reconnect_delay;
        let _mqtt_task = AbortOnDropHandle::new(tokio::spawn(async move {
            let mut events = std::pin::pin!(mqtt_events(eventloop, reconnect_delay));
            while let Some(event) = events.next().await {
                if sender.send(event).is_err() {
                    return;
                }
            }
        }));

        let engine = SyncEngine::new(connection, client, &CATALOG, topics);
        let interval = tokio::time::interval(*args.poll_interval);
        let polls = IntervalStream::new(interval).map(|_| Tick::Poll);
        let events = UnboundedReceiverStream::new(receiver).map(Tick::Mqtt);
        let mut ticks = std::pin::pin!(polls.merge(events));
        let mut connected = false;
        while let Some(tick) = ticks.next().await {
            let result = match tick {
                Tick::Poll if !connected => {
                    trace!("not connected to the MQTT broker, skipping a poll");
                    Ok(())
                }
                Tick::Poll => engine.publish_all().await,
                Tick::Mqtt(MqttEvent::Disconnected) => {
                    connected = false;
                    Ok(())
                }
                Tick::Mqtt(MqttEvent::Connected) => {
                    info!("connected to the MQTT broker");
                    connected = true;
                    publish_discovery(&engine, &identity, &args).await?;
                    engine.subscribe_for_writes().await.map_err(Error::Subscribe)?;
                    engine.publish_all().await
                }
                Tick::Mqtt(MqttEvent::Message { topic, payload }) => {
                    debug!(%topic, "received a message");
                    engine.handle_message(&topic, &payload).await
                }
            };
            if let Err(e) = result {
                warn!(message = "sync failed", error = (&e as &dyn std::error::Error));
            }
        }
        Err(Error::EventLoopEnded)
    }
}
