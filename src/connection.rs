use crate::modbus::{self, ModbusTCPCodec, Operation, Request, ResponseKind};
use crate::transport::{RegisterTransport, TransportError};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
    #[error("no response after {0} attempts")]
    Timeout(usize),
}

#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Option<modbus::Response>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn mark_timeout(&self, transaction_id: u16) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, None);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn add_response(&self, response: modbus::Response) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(response.transaction_id, Some(response));
        self.change_notify.notify_waiters();
        drop(guard);
    }

    /// Wait until the worker reports back on `transaction_id`. `None` means it timed out.
    pub async fn wait_for(&self, transaction_id: u16) -> Option<modbus::Response> {
        loop {
            // Register interest before looking, or a response landing in between is missed.
            let mut notified = std::pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&transaction_id) {
                    return v;
                }
            }
            notified.await;
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Connect to the ventilation unit controller over Modbus TCP (`host:port`).
    #[arg(long)]
    tcp: String,

    /// The modbus device ID.
    #[arg(long, short = 'i', default_value = "1")]
    device_id: u8,

    /// If the modbus response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// How many times a timed out or rejected request is sent again before giving up.
    #[arg(long, default_value = "3")]
    retries: usize,

    /// Reconnect to the modbus server after the specified number of reads timeout.
    #[arg(long, default_value = "3")]
    reconnect_after_timeouts: usize,

    /// How long to wait before trying to connect again after the connection was lost.
    #[arg(long, default_value = "5s")]
    reconnect_delay: humantime::Duration,

    /// The amount of additional time to wait between sending requests over TCP.
    ///
    /// Interacting too fast can make some Modbus TCP gateways behave poorly.
    #[arg(long, default_value = "20ms")]
    tcp_send_delay: humantime::Duration,

    /// The amount of additional time to wait after receiving a server busy exception.
    #[arg(long, default_value = "25ms")]
    server_busy_retry_delay: humantime::Duration,
}

/// A Modbus TCP connection to one controller.
///
/// Requests are queued to a worker task that keeps at most one request in flight at a time.
pub struct Connection {
    pub request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    pub worker: tokio::task::JoinHandle<Result<(), Error>>,
    pub response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    args: Args,
}

impl Connection {
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker = Arc::<ResponseTracker>::default();
        let mut worker = TcpWorker {
            reconnect_countdown: args.reconnect_after_timeouts,
            args: args.clone(),
            responses: Arc::clone(&response_tracker),
        };
        // Fail early if the controller cannot be reached at all.
        let io = worker.connect().await?;
        let worker = tokio::task::spawn(worker.main_loop(io, jobs));
        Ok(Self {
            request_queue,
            worker,
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            args,
        })
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn send(&self, operation: Operation) -> Result<Option<modbus::Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request = Request { device_id: self.args.device_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        Ok(self.response_tracker.wait_for(transaction_id).await)
    }

    /// [`Self::send`] but retries timeouts and `Server Busy` exceptions.
    pub async fn send_retrying(&self, operation: Operation) -> Result<modbus::Response, Error> {
        let attempts = self.args.retries + 1;
        for attempt in 1..=attempts {
            let Some(response) = self.send(operation).await? else {
                debug!(attempt, ?operation, "modbus request timed out");
                continue;
            };
            if response.is_server_busy() {
                tokio::time::sleep(*self.args.server_busy_retry_delay).await;
                continue;
            }
            return Ok(response);
        }
        Err(Error::Timeout(attempts))
    }
}

impl RegisterTransport for Connection {
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let operation = Operation::GetHoldings { address, count };
        let response = self.send_retrying(operation).await.map_err(TransportError::Modbus)?;
        match response.kind {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => Ok(values),
            ResponseKind::GetHoldings { values } => {
                Err(TransportError::ShortResponse { expected: count, got: values.len() })
            }
            ResponseKind::ErrorCode(code) => Err(TransportError::Exception(code)),
            ResponseKind::SetHolding { .. } => Err(TransportError::UnexpectedResponse),
        }
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), TransportError> {
        let operation = Operation::SetHolding { address, value };
        let response = self.send_retrying(operation).await.map_err(TransportError::Modbus)?;
        match response.kind {
            ResponseKind::SetHolding { address: a, value: v } if a == address && v == value => {
                Ok(())
            }
            ResponseKind::ErrorCode(code) => Err(TransportError::Exception(code)),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
}

struct TcpWorker {
    args: Args,
    responses: Arc<ResponseTracker>,
    reconnect_countdown: usize,
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

enum Outcome {
    Answered,
    TimedOut,
    Broken,
}

impl TcpWorker {
    async fn main_loop(
        mut self,
        mut io: TcpIo,
        mut jobs: UnboundedReceiver<modbus::Request>,
    ) -> Result<(), Error> {
        loop {
            let Some(req) = jobs.recv().await else {
                return io.close().await.map_err(Error::Shutdown);
            };
            match self.exchange(&mut io, &req).await {
                Outcome::Answered => {
                    self.reconnect_countdown = self.args.reconnect_after_timeouts;
                }
                Outcome::TimedOut => {
                    self.responses.mark_timeout(req.transaction_id);
                    if let Some(new_count) = self.reconnect_countdown.checked_sub(1) {
                        self.reconnect_countdown = new_count;
                    } else {
                        warn!("too many modbus requests timed out, will reconnect");
                        io = self.reconnect(&mut jobs).await;
                    }
                }
                Outcome::Broken => {
                    self.responses.mark_timeout(req.transaction_id);
                    io = self.reconnect(&mut jobs).await;
                }
            }
            tokio::time::sleep(*self.args.tcp_send_delay).await;
        }
    }

    async fn exchange(&mut self, io: &mut TcpIo, req: &Request) -> Outcome {
        if let Err(e) = io.send(req).await {
            warn!(message = "sending request failed", error = (&e as &dyn std::error::Error));
            return Outcome::Broken;
        }
        let deadline = Instant::now() + *self.args.read_timeout;
        loop {
            match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => {
                    debug!(transaction_id = req.transaction_id, "an inflight request timed out");
                    return Outcome::TimedOut;
                }
                Ok(None) => {
                    warn!("modbus server closed the connection");
                    return Outcome::Broken;
                }
                Ok(Some(Err(e))) => {
                    warn!(message = "receiving failed", error = (&e as &dyn std::error::Error));
                    return Outcome::Broken;
                }
                Ok(Some(Ok(response))) if response.transaction_id != req.transaction_id => {
                    debug!(
                        message = "a response we were not expecting",
                        transaction = response.transaction_id
                    );
                }
                Ok(Some(Ok(response))) => {
                    trace!(message = "decoded a response", transaction = response.transaction_id);
                    self.responses.add_response(response);
                    return Outcome::Answered;
                }
            }
        }
    }

    /// Keep trying to connect. Requests queued while disconnected are reported as timed out.
    async fn reconnect(&mut self, jobs: &mut UnboundedReceiver<modbus::Request>) -> TcpIo {
        loop {
            while let Ok(req) = jobs.try_recv() {
                self.responses.mark_timeout(req.transaction_id);
            }
            match self.connect().await {
                Ok(io) => return io,
                Err(e) => {
                    warn!(message = "reconnecting failed", error = (&e as &dyn std::error::Error));
                    tokio::time::sleep(*self.args.reconnect_delay).await;
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        let address = &self.args.tcp;
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        self.reconnect_countdown = self.args.reconnect_after_timeouts;
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }
}
