//! A scripted in-process broker for integration tests.
//!
//! Listens on a real socket, speaks the length-prefixed framing, and
//! answers each request through a test-provided handler. Replies are
//! written from their own tasks so a test can deliberately deliver
//! responses out of order.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Call at the top of a test to see client logs with RUST_LOG set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A decoded request header plus the opaque body.
#[derive(Clone, Debug)]
pub struct RequestFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: Vec<u8>,
}

/// What the handler wants done with one request.
pub enum Reply {
    /// Respond with this body (correlation id is prepended).
    Body(Vec<u8>),
    /// Respond after a delay; lets tests reorder completions.
    Delayed(Vec<u8>, Duration),
    /// Never respond.
    Ignore,
    /// Drop the connection.
    Close,
}

type Handler = Arc<dyn Fn(RequestFrame) -> Reply + Send + Sync>;

pub struct MockBroker {
    addr: SocketAddr,
    counts: Arc<Mutex<HashMap<i16, usize>>>,
}

impl MockBroker {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(RequestFrame) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counts: Arc<Mutex<HashMap<i16, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let handler: Handler = Arc::new(handler);

        let accept_counts = counts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(stream, handler.clone(), accept_counts.clone()));
            }
        });

        Self { addr, counts }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr_string(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// How many requests with this api key the broker has seen.
    pub fn request_count(&self, api_key: i16) -> usize {
        *self.counts.lock().unwrap().get(&api_key).unwrap_or(&0)
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    handler: Handler,
    counts: Arc<Mutex<HashMap<i16, usize>>>,
) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let mut size = [0u8; 4];
        if reader.read_exact(&mut size).await.is_err() {
            return;
        }
        let length = i32::from_be_bytes(size);
        let mut payload = vec![0u8; length as usize];
        if reader.read_exact(&mut payload).await.is_err() {
            return;
        }

        let frame = parse_request(&payload);
        *counts.lock().unwrap().entry(frame.api_key).or_insert(0) += 1;
        let correlation_id = frame.correlation_id;

        match handler(frame) {
            Reply::Body(body) => {
                write_reply(&writer, correlation_id, body, None);
            }
            Reply::Delayed(body, delay) => {
                write_reply(&writer, correlation_id, body, Some(delay));
            }
            Reply::Ignore => {}
            Reply::Close => {
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

fn write_reply(
    writer: &Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    correlation_id: i32,
    body: Vec<u8>,
    delay: Option<Duration>,
) {
    let writer = writer.clone();
    tokio::spawn(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        frame.extend_from_slice(&correlation_id.to_be_bytes());
        frame.extend_from_slice(&body);
        let mut writer = writer.lock().await;
        let _ = writer.write_all(&frame).await;
    });
}

fn parse_request(payload: &[u8]) -> RequestFrame {
    let api_key = i16::from_be_bytes(payload[0..2].try_into().unwrap());
    let api_version = i16::from_be_bytes(payload[2..4].try_into().unwrap());
    let correlation_id = i32::from_be_bytes(payload[4..8].try_into().unwrap());
    let client_id_len = i16::from_be_bytes(payload[8..10].try_into().unwrap()) as usize;
    let client_id = String::from_utf8_lossy(&payload[10..10 + client_id_len]).to_string();
    let body = payload[10 + client_id_len..].to_vec();

    RequestFrame {
        api_key,
        api_version,
        correlation_id,
        client_id,
        body,
    }
}

//
// wire builders for the response bodies the tests hand back
//

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as i16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_zigzag(out: &mut Vec<u8>, value: i64) {
    let mut raw = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let mut byte = (raw & 0x7f) as u8;
        raw >>= 7;
        if raw != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if raw == 0 {
            return;
        }
    }
}

/// Metadata response v0: brokers are `(node_id, host, port)`, topics
/// are `(name, [(partition, leader)])`.
pub fn metadata_body(brokers: &[(i32, &str, u16)], topics: &[(&str, Vec<(i32, i32)>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(brokers.len() as i32).to_be_bytes());
    for (node_id, host, port) in brokers {
        out.extend_from_slice(&node_id.to_be_bytes());
        put_str(&mut out, host);
        out.extend_from_slice(&(*port as i32).to_be_bytes());
    }
    out.extend_from_slice(&(topics.len() as i32).to_be_bytes());
    for (name, partitions) in topics {
        out.extend_from_slice(&0i16.to_be_bytes()); // topic error
        put_str(&mut out, name);
        out.extend_from_slice(&(partitions.len() as i32).to_be_bytes());
        for (partition, leader) in partitions {
            out.extend_from_slice(&0i16.to_be_bytes()); // partition error
            out.extend_from_slice(&partition.to_be_bytes());
            out.extend_from_slice(&leader.to_be_bytes());
            out.extend_from_slice(&1i32.to_be_bytes()); // replicas
            out.extend_from_slice(&leader.to_be_bytes());
            out.extend_from_slice(&1i32.to_be_bytes()); // isr
            out.extend_from_slice(&leader.to_be_bytes());
        }
    }
    out
}

/// Produce response v3: topics are `(name, [(partition, error, base_offset)])`.
pub fn produce_body(topics: &[(&str, Vec<(i32, i16, i64)>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(topics.len() as i32).to_be_bytes());
    for (name, partitions) in topics {
        put_str(&mut out, name);
        out.extend_from_slice(&(partitions.len() as i32).to_be_bytes());
        for (partition, error, base_offset) in partitions {
            out.extend_from_slice(&partition.to_be_bytes());
            out.extend_from_slice(&error.to_be_bytes());
            out.extend_from_slice(&base_offset.to_be_bytes());
            out.extend_from_slice(&(-1i64).to_be_bytes()); // log append time
        }
    }
    out.extend_from_slice(&0i32.to_be_bytes()); // throttle
    out
}

/// FindCoordinator response v0.
pub fn find_coordinator_body(error: i16, node_id: i32, host: &str, port: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&error.to_be_bytes());
    out.extend_from_slice(&node_id.to_be_bytes());
    put_str(&mut out, host);
    out.extend_from_slice(&(port as i32).to_be_bytes());
    out
}

/// ListOffsets response v1 with a single partition entry.
pub fn list_offsets_body(topic: &str, partition: i32, error: i16, offset: i64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&1i32.to_be_bytes());
    put_str(&mut out, topic);
    out.extend_from_slice(&1i32.to_be_bytes());
    out.extend_from_slice(&partition.to_be_bytes());
    out.extend_from_slice(&error.to_be_bytes());
    out.extend_from_slice(&(-1i64).to_be_bytes()); // timestamp
    out.extend_from_slice(&offset.to_be_bytes());
    out
}

/// One uncompressed v2 record batch for fetch responses.
pub fn record_batch(base_offset: i64, base_timestamp: i64, records: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut encoded_records = Vec::new();
    for (index, (key, value)) in records.iter().enumerate() {
        let mut record = Vec::new();
        record.push(0); // attributes
        put_zigzag(&mut record, 0); // timestamp delta
        put_zigzag(&mut record, index as i64); // offset delta
        put_zigzag(&mut record, key.len() as i64);
        record.extend_from_slice(key);
        put_zigzag(&mut record, value.len() as i64);
        record.extend_from_slice(value);
        put_zigzag(&mut record, 0); // header count
        put_zigzag(&mut encoded_records, record.len() as i64);
        encoded_records.extend_from_slice(&record);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&(-1i32).to_be_bytes()); // partition leader epoch
    body.push(2); // magic
    body.extend_from_slice(&0u32.to_be_bytes()); // crc (unchecked)
    body.extend_from_slice(&0i16.to_be_bytes()); // attributes
    body.extend_from_slice(&((records.len() as i32) - 1).to_be_bytes()); // last offset delta
    body.extend_from_slice(&base_timestamp.to_be_bytes());
    body.extend_from_slice(&base_timestamp.to_be_bytes());
    body.extend_from_slice(&(-1i64).to_be_bytes()); // producer id
    body.extend_from_slice(&(-1i16).to_be_bytes()); // producer epoch
    body.extend_from_slice(&(-1i32).to_be_bytes()); // base sequence
    body.extend_from_slice(&(records.len() as i32).to_be_bytes());
    body.extend_from_slice(&encoded_records);

    let mut batch = Vec::new();
    batch.extend_from_slice(&base_offset.to_be_bytes());
    batch.extend_from_slice(&(body.len() as i32).to_be_bytes());
    batch.extend_from_slice(&body);
    batch
}

/// Fetch response v4 with one topic and one partition.
pub fn fetch_body(topic: &str, partition: i32, error: i16, record_set: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0i32.to_be_bytes()); // throttle
    out.extend_from_slice(&1i32.to_be_bytes());
    put_str(&mut out, topic);
    out.extend_from_slice(&1i32.to_be_bytes());
    out.extend_from_slice(&partition.to_be_bytes());
    out.extend_from_slice(&error.to_be_bytes());
    out.extend_from_slice(&i64::MAX.to_be_bytes()); // high watermark
    out.extend_from_slice(&i64::MAX.to_be_bytes()); // last stable offset
    out.extend_from_slice(&0i32.to_be_bytes()); // aborted transactions
    out.extend_from_slice(&(record_set.len() as i32).to_be_bytes());
    out.extend_from_slice(record_set);
    out
}

/// The group id of a find-coordinator request body.
pub fn coordinator_key(body: &[u8]) -> String {
    let len = i16::from_be_bytes(body[0..2].try_into().unwrap()) as usize;
    String::from_utf8_lossy(&body[2..2 + len]).to_string()
}

/// Offset of the first partition in a single-partition fetch request
/// body.
pub fn fetch_request_offset(body: &[u8]) -> i64 {
    let cursor = fetch_first_partition_at(body);
    i64::from_be_bytes(body[cursor + 4..cursor + 12].try_into().unwrap())
}

/// Partition fetch buffer of the first partition in a
/// single-partition fetch request body.
pub fn fetch_request_max_partition_bytes(body: &[u8]) -> i32 {
    let cursor = fetch_first_partition_at(body);
    i32::from_be_bytes(body[cursor + 12..cursor + 16].try_into().unwrap())
}

fn fetch_first_partition_at(body: &[u8]) -> usize {
    // replica(4) max_wait(4) min_bytes(4) max_bytes(4) isolation(1)
    // topic_count(4) name_len(2) name partition_count(4)
    let name_len = i16::from_be_bytes(body[21..23].try_into().unwrap()) as usize;
    23 + name_len + 4
}

/// Timestamp of the first partition in a single-partition list-offsets
/// request body.
pub fn list_offsets_request_timestamp(body: &[u8]) -> i64 {
    // replica(4) topic_count(4) name_len(2) name partition_count(4) partition(4)
    let name_len = i16::from_be_bytes(body[8..10].try_into().unwrap()) as usize;
    let cursor = 10 + name_len + 4 + 4;
    i64::from_be_bytes(body[cursor..cursor + 8].try_into().unwrap())
}
