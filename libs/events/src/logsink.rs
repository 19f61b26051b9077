//! Log sink bridge: a tracing layer serializing events to JSON lines,
//! buffered in a bounded ring until the sink address is learned, then
//! forwarded over TCP (newline-delimited) or UDP (one datagram per entry).

use std::collections::VecDeque;
use std::fmt;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// Buffer budget for entries accumulated before the sink is reachable.
const RING_BUDGET: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkProtocol {
    Tcp,
    Udp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkAddress {
    pub protocol: SinkProtocol,
    pub address: String,
}

impl SinkAddress {
    /// Accepts `tcp://host:port`, `udp://host:port` or a bare `host:port`
    /// (TCP).
    pub fn parse(raw: &str) -> Self {
        if let Some(address) = raw.strip_prefix("udp://") {
            Self {
                protocol: SinkProtocol::Udp,
                address: address.to_string(),
            }
        } else {
            Self {
                protocol: SinkProtocol::Tcp,
                address: raw.strip_prefix("tcp://").unwrap_or(raw).to_string(),
            }
        }
    }
}

/// Create the layer/bridge pair. Install the layer into the subscriber and
/// run the bridge; call [`LogBridge::set_endpoint`] once the overlay address
/// is known.
pub fn pair(machine_id: &str) -> (LogSinkLayer, LogBridge) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (endpoint_tx, endpoint_rx) = watch::channel(None);

    (
        LogSinkLayer {
            machine_id: machine_id.to_string(),
            tx,
        },
        LogBridge {
            rx,
            endpoint_tx,
            endpoint_rx,
        },
    )
}

pub struct LogSinkLayer {
    machine_id: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct JsonVisitor(serde_json::Map<String, serde_json::Value>);

impl Visit for JsonVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}").into());
    }
}

impl<S> tracing_subscriber::Layer<S> for LogSinkLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut fields = visitor.0;
        fields.insert("ts".to_string(), Utc::now().to_rfc3339().into());
        fields.insert(
            "level".to_string(),
            event.metadata().level().to_string().into(),
        );
        fields.insert("machine".to_string(), self.machine_id.clone().into());

        if let Ok(mut line) = serde_json::to_vec(&serde_json::Value::Object(fields)) {
            line.push(b'\n');
            let _ = self.tx.send(line);
        }
    }
}

pub struct LogBridge {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    endpoint_tx: watch::Sender<Option<SinkAddress>>,
    endpoint_rx: watch::Receiver<Option<SinkAddress>>,
}

/// Handle to point the bridge at its destination once known.
#[derive(Clone)]
pub struct LogSinkHandle {
    endpoint_tx: watch::Sender<Option<SinkAddress>>,
}

impl LogSinkHandle {
    pub fn set_endpoint(&self, address: SinkAddress) {
        let _ = self.endpoint_tx.send(Some(address));
    }
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl LogBridge {
    pub fn handle(&self) -> LogSinkHandle {
        LogSinkHandle {
            endpoint_tx: self.endpoint_tx.clone(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ring: VecDeque<Vec<u8>> = VecDeque::new();
        let mut ring_bytes = 0usize;
        // Writes are serialized through this slot; a failure drops the
        // connection and the next entry re-establishes it.
        let connection: Mutex<Option<Connection>> = Mutex::new(None);
        let mut endpoint_rx = self.endpoint_rx.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = endpoint_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Destination learned: replay everything buffered.
                    let pending: Vec<Vec<u8>> = ring.drain(..).collect();
                    ring_bytes = 0;
                    for entry in pending {
                        self.forward(&connection, entry).await;
                    }
                }
                entry = self.rx.recv() => {
                    let Some(entry) = entry else { return };

                    if self.endpoint_rx.borrow().is_none() {
                        ring_bytes += entry.len();
                        ring.push_back(entry);
                        while ring_bytes > RING_BUDGET {
                            if let Some(dropped) = ring.pop_front() {
                                ring_bytes -= dropped.len();
                            } else {
                                break;
                            }
                        }
                        continue;
                    }

                    self.forward(&connection, entry).await;
                }
            }
        }
    }

    async fn forward(&self, connection: &Mutex<Option<Connection>>, entry: Vec<u8>) {
        let Some(sink) = self.endpoint_rx.borrow().clone() else {
            return;
        };

        let mut slot = connection.lock().await;

        if slot.is_none() {
            *slot = match sink.protocol {
                SinkProtocol::Tcp => match TcpStream::connect(&sink.address).await {
                    Ok(stream) => Some(Connection::Tcp(stream)),
                    Err(_) => None,
                },
                SinkProtocol::Udp => match UdpSocket::bind("0.0.0.0:0").await {
                    Ok(socket) => match socket.connect(&sink.address).await {
                        Ok(()) => Some(Connection::Udp(socket)),
                        Err(_) => None,
                    },
                    Err(_) => None,
                },
            };
        }

        let failed = match slot.as_mut() {
            Some(Connection::Tcp(stream)) => stream.write_all(&entry).await.is_err(),
            Some(Connection::Udp(socket)) => socket.send(&entry).await.is_err(),
            None => false,
        };
        if failed {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_address_parsing() {
        assert_eq!(
            SinkAddress::parse("tcp://10.0.0.1:8092"),
            SinkAddress {
                protocol: SinkProtocol::Tcp,
                address: "10.0.0.1:8092".to_string()
            }
        );
        assert_eq!(
            SinkAddress::parse("udp://10.0.0.1:8092").protocol,
            SinkProtocol::Udp
        );
        assert_eq!(
            SinkAddress::parse("10.0.0.1:8092").protocol,
            SinkProtocol::Tcp
        );
    }

    #[tokio::test]
    async fn test_buffered_entries_replay_after_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (layer, bridge) = pair("machine-1");
        let handle = bridge.handle();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(bridge.run(cancel.clone()));

        // Entries emitted before the endpoint is known are buffered.
        layer.tx.send(b"{\"msg\":\"early\"}\n".to_vec()).unwrap();

        handle.set_endpoint(SinkAddress::parse(&addr.to_string()));

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buffer = Vec::new();
        use tokio::io::AsyncReadExt;
        let mut chunk = [0u8; 256];
        let n = conn.read(&mut chunk).await.unwrap();
        buffer.extend_from_slice(&chunk[..n]);
        assert!(String::from_utf8_lossy(&buffer).contains("early"));

        cancel.cancel();
        run.await.unwrap();
    }
}
