//! The two collaborators the synchronization engine talks through.

use std::future::Future;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("modbus communication failed")]
    Modbus(#[source] crate::connection::Error),
    #[error("modbus server responded with exception code {0}")]
    Exception(u8),
    #[error("modbus response carried {got} registers, {expected} were requested")]
    ShortResponse { expected: u16, got: usize },
    #[error("modbus response did not match the request")]
    UnexpectedResponse,
    #[error("mqtt client request failed")]
    Mqtt(#[source] rumqttc::v5::ClientError),
    #[error("transport is disconnected")]
    Disconnected,
}

/// Access to the numbered holding registers of one device.
///
/// Implementations are expected to serialize requests: the device does not handle concurrent
/// in-flight requests.
pub trait RegisterTransport: Sync {
    fn read_registers(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    fn write_register(
        &self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn read_register(
        &self,
        address: u16,
    ) -> impl Future<Output = Result<u16, TransportError>> + Send {
        async move {
            let words = self.read_registers(address, 1).await?;
            words.first().copied().ok_or(TransportError::ShortResponse { expected: 1, got: 0 })
        }
    }
}

pub trait PubSubTransport: Sync {
    /// Publish a retained message.
    fn publish(
        &self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(&self, pattern: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl PubSubTransport for rumqttc::v5::AsyncClient {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        let qos = rumqttc::v5::mqttbytes::QoS::AtLeastOnce;
        rumqttc::v5::AsyncClient::publish(self, topic, qos, true, payload.to_string())
            .await
            .map_err(TransportError::Mqtt)
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let qos = rumqttc::v5::mqttbytes::QoS::AtLeastOnce;
        rumqttc::v5::AsyncClient::subscribe(self, pattern, qos).await.map_err(TransportError::Mqtt)
    }
}
