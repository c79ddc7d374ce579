//! Multiplexed TCP channel to a broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::network::{frame, BrokerChannel, BrokerEndpoint, ChannelConfig};
use crate::protocol::KafkaRequest;

/// Offset of the correlation id inside a request payload:
/// `api_key: i16` + `api_version: i16` come first in every header.
const CORRELATION_OFFSET: usize = 4;

/// Reference counted TCP connection to a Kafka/Redpanda broker.
///
/// This is designed to be held by a router which dispatches many of
/// these connections at the behest of either a consumer or producer.
///
/// One background reader owns the read half of the socket and matches
/// response frames to callers by correlation id, so any number of tasks
/// can have requests in flight on the same channel concurrently. A
/// socket error in either direction fails every pending request and
/// leaves the channel permanently closed; reconnection is the router's
/// job.
#[derive(Clone, Debug)]
pub struct TcpChannel {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    endpoint: BrokerEndpoint,
    config: ChannelConfig,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: Mutex<ChannelState>,
    correlation: AtomicI32,
    shutdown: CancellationToken,
}

#[derive(Debug, Default)]
struct ChannelState {
    /// One completion slot per in-flight request.
    pending: HashMap<i32, oneshot::Sender<Result<Bytes>>>,
    /// Correlation ids whose callers gave up; a late response frame for
    /// one of these is discarded instead of failing the connection.
    abandoned: HashSet<i32>,
    /// Set once, when the channel dies; every send afterwards fails
    /// with this error immediately.
    fault: Option<Error>,
}

impl TcpChannel {
    fn next_correlation_id(&self) -> i32 {
        // monotonic per connection, wrapping within non-negative i32
        self.shared.correlation.fetch_add(1, Ordering::Relaxed) & i32::MAX
    }

    fn abandon(&self, correlation_id: i32) {
        let mut state = self.shared.state.lock().expect("channel state poisoned");
        if state.pending.remove(&correlation_id).is_some() {
            state.abandoned.insert(correlation_id);
        }
    }

    fn register(&self, correlation_id: i32) -> Result<oneshot::Receiver<Result<Bytes>>> {
        let mut state = self.shared.state.lock().expect("channel state poisoned");
        if let Some(fault) = &state.fault {
            return Err(fault.clone());
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(correlation_id, tx);
        Ok(rx)
    }

    fn check_fault(&self) -> Result<()> {
        let state = self.shared.state.lock().expect("channel state poisoned");
        match &state.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("channel state poisoned")
            .pending
            .len()
    }
}

/// Fail the channel: every pending slot completes with `fault` and all
/// subsequent sends are refused with the same error.
fn poison(shared: &Shared, fault: Error) {
    let mut state = shared.state.lock().expect("channel state poisoned");
    if state.fault.is_none() {
        state.fault = Some(fault.clone());
    }
    let fault = state.fault.clone().expect("fault just set");
    for (_, slot) in state.pending.drain() {
        let _ = slot.send(Err(fault.clone()));
    }
    state.abandoned.clear();
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    let fault = loop {
        let payload = tokio::select! {
            payload = frame::read_frame(&mut reader, shared.config.max_frame_bytes) => payload,
            _ = shared.shutdown.cancelled() => {
                break Error::ConnectionClosed(shared.endpoint.to_string());
            }
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!("Reader for {} stopping: {:?}", shared.endpoint, err);
                break err;
            }
        };

        if payload.len() < 4 {
            break Error::ParsingError(payload.freeze());
        }
        let correlation_id =
            i32::from_be_bytes(payload[..4].try_into().expect("four bytes checked"));

        let slot = {
            let mut state = shared.state.lock().expect("channel state poisoned");
            match state.pending.remove(&correlation_id) {
                Some(slot) => Some(slot),
                None if state.abandoned.remove(&correlation_id) => {
                    tracing::trace!(
                        "Discarding late response for abandoned correlation id {}",
                        correlation_id
                    );
                    None
                }
                None => {
                    drop(state);
                    tracing::error!(
                        "ERROR: Response on {} with unknown correlation id {}",
                        shared.endpoint,
                        correlation_id
                    );
                    break Error::CorrelationMismatch(correlation_id);
                }
            }
        };

        if let Some(slot) = slot {
            let _ = slot.send(Ok(payload.freeze()));
        }
    };

    poison(&shared, fault);
}

#[async_trait]
impl BrokerChannel for TcpChannel {
    async fn connect(endpoint: BrokerEndpoint, config: ChannelConfig) -> Result<Self> {
        tracing::debug!("Connecting to {}", endpoint);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(endpoint.addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::IoError(e.kind()))?;

        let (reader, writer) = stream.into_split();
        let shared = Arc::new(Shared {
            endpoint,
            config,
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(ChannelState::default()),
            correlation: AtomicI32::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(shared.clone(), reader));

        Ok(Self { shared })
    }

    async fn send<R: KafkaRequest>(
        &self,
        req: &R,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        // frame size placeholder, patched once the payload is rendered
        let mut buffer = Vec::with_capacity(512);
        buffer.extend_from_slice(&[0, 0, 0, 0]);
        req.encode(&mut buffer)?;
        let size = buffer.len() as i32 - 4;
        size.encode(&mut &mut buffer[..])?;

        if buffer.len() < 4 + CORRELATION_OFFSET + 4 {
            return Err(Error::EncodingError);
        }

        // the channel owns correlation ids; whatever the request was
        // built with is overwritten at the known header offset
        let correlation_id = self.next_correlation_id();
        let correlation_at = 4 + CORRELATION_OFFSET;
        buffer[correlation_at..correlation_at + 4].copy_from_slice(&correlation_id.to_be_bytes());

        let slot = if req.expects_response() {
            Some(self.register(correlation_id)?)
        } else {
            self.check_fault()?;
            None
        };

        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(err) = frame::write_frame(&mut *writer, &buffer).await {
                tracing::error!("ERROR: Writing to {} {:?}", self.shared.endpoint, err);
                poison(&self.shared, err.clone());
                return Err(err);
            }
        }

        let Some(slot) = slot else {
            return Ok(None);
        };

        let deadline = deadline.unwrap_or(self.shared.config.request_timeout);
        tokio::select! {
            response = slot => match response {
                Ok(response) => response.map(Some),
                // the reader dropped the slot while poisoning
                Err(_) => Err(self
                    .check_fault()
                    .err()
                    .unwrap_or_else(|| Error::ConnectionClosed(self.shared.endpoint.to_string()))),
            },
            _ = tokio::time::sleep(deadline) => {
                self.abandon(correlation_id);
                Err(Error::Timeout)
            }
            _ = cancel.cancelled() => {
                self.abandon(correlation_id);
                Err(Error::Cancelled)
            }
        }
    }

    fn endpoint(&self) -> &BrokerEndpoint {
        &self.shared.endpoint
    }

    fn is_closed(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("channel state poisoned")
            .fault
            .is_some()
    }

    fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::FindCoordinatorRequest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal broker: answers every frame with a canned
    /// find-coordinator body under the request's correlation id.
    async fn echo_broker() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    loop {
                        let mut size = [0u8; 4];
                        if stream.read_exact(&mut size).await.is_err() {
                            return;
                        }
                        let length = i32::from_be_bytes(size) as usize;
                        let mut payload = vec![0u8; length];
                        if stream.read_exact(&mut payload).await.is_err() {
                            return;
                        }

                        let mut body = Vec::new();
                        body.extend_from_slice(&0i16.to_be_bytes());
                        body.extend_from_slice(&1i32.to_be_bytes());
                        body.extend_from_slice(&9i16.to_be_bytes());
                        body.extend_from_slice(b"localhost");
                        body.extend_from_slice(&9092i32.to_be_bytes());

                        let mut frame = Vec::new();
                        frame.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
                        frame.extend_from_slice(&payload[4..8]);
                        frame.extend_from_slice(&body);
                        if stream.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn pending_map_drains_as_sends_complete() {
        let addr = echo_broker().await;
        let endpoint = BrokerEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            addr,
        };
        let channel = TcpChannel::connect(endpoint, ChannelConfig::default())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let request = FindCoordinatorRequest::new(0, "test", "group");
            let response = channel.send(&request, None, &cancel).await.unwrap();
            assert!(response.is_some());
            assert_eq!(channel.pending_count(), 0);
        }

        channel.close();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(channel.is_closed());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn correlation_ids_increase_per_send() {
        let addr = echo_broker().await;
        let endpoint = BrokerEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            addr,
        };
        let channel = TcpChannel::connect(endpoint, ChannelConfig::default())
            .await
            .unwrap();

        assert_eq!(channel.next_correlation_id(), 1);
        assert_eq!(channel.next_correlation_id(), 2);

        // the counter stays non-negative across the wrap
        channel.shared.correlation.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(channel.next_correlation_id(), i32::MAX);
        let wrapped = channel.next_correlation_id();
        assert!(wrapped >= 0);
    }
}
