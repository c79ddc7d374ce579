//! Encoding and creation for Produce requests.

use bytes::{BufMut, Bytes};

use crate::{
    compression::{self, Compression},
    encode::{encode_zigzag_varint, ToByte},
    error::Result,
    protocol::{HeaderRequest, KafkaRequest},
    utils::{now, to_crc},
};

const API_KEY_PRODUCE: i16 = 0;
const API_VERSION: i16 = 3;

/// The magic byte (a.k.a version) we use for sent record batches.
const MESSAGE_MAGIC_BYTE: i8 = 2;

/*
Produce Request (Version: 3) => transactional_id acks timeout [topic_data]
  transactional_id => NULLABLE_STRING
  acks => INT16
  timeout => INT32
  topic_data => topic [data]
    topic => STRING
    data => partition record_set
      partition => INT32
      record_set => RECORDS
*/

/// Record batch attributes.
///
/// Only the compression bits are client controlled; the rest of the
/// field stays zero on produce.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Attributes {
    pub compression: Compression,
}

impl Attributes {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }
}

impl From<Attributes> for i16 {
    fn from(attributes: Attributes) -> i16 {
        attributes.compression.to_attributes()
    }
}

/// The base Produce request object.
///
/// Records are appended with [`add`](Self::add) and grouped by topic
/// and partition on the way in; within one partition they are encoded
/// in the order they were added.
#[derive(Debug)]
pub struct ProduceRequest {
    pub header: HeaderRequest,
    /// The transactional ID of the producer. This can be null for non-transactional producers.
    pub transactional_id: Option<String>,
    /// The number of acknowledgments the producer requires the leader to have received before considering a request complete. Allowed values: 0 for no acknowledgments, 1 for only the leader and -1 for the full ISR.
    pub required_acks: i16,
    /// The timeout to await a response in milliseconds.
    pub timeout_ms: i32,
    /// Batch attributes shared by every partition in the request.
    pub attributes: Attributes,
    /// Each topic to produce to.
    topic_partitions: Vec<TopicPartition>,
}

impl ProduceRequest {
    pub fn new(
        required_acks: i16,
        timeout_ms: i32,
        correlation_id: i32,
        client_id: &str,
        attributes: Attributes,
    ) -> ProduceRequest {
        ProduceRequest {
            header: HeaderRequest::new(API_KEY_PRODUCE, API_VERSION, correlation_id, client_id),
            transactional_id: None,
            required_acks,
            timeout_ms,
            attributes,
            topic_partitions: vec![],
        }
    }

    pub fn add(
        &mut self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<Header>,
        timestamp: Option<i64>,
    ) {
        let message = Message {
            key,
            value,
            headers,
            timestamp: timestamp.unwrap_or_else(now),
        };
        match self
            .topic_partitions
            .iter_mut()
            .find(|tp| tp.name == topic)
        {
            Some(tp) => tp.add(partition, message),
            None => {
                let mut tp = TopicPartition::new(topic);
                tp.add(partition, message);
                self.topic_partitions.push(tp);
            }
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topic_partitions.len()
    }

    pub fn partition_count(&self, topic: &str) -> usize {
        self.topic_partitions
            .iter()
            .find(|tp| tp.name == topic)
            .map(|tp| tp.partitions.len())
            .unwrap_or(0)
    }
}

impl ToByte for ProduceRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        tracing::trace!("Encoding ProduceRequest {:?}", self);
        self.header.encode(buffer)?;
        self.transactional_id.as_deref().encode(buffer)?;
        self.required_acks.encode(buffer)?;
        self.timeout_ms.encode(buffer)?;
        crate::encode::encode_as_array(buffer, &self.topic_partitions, |buffer, tp| {
            tp.encode(buffer, self.attributes.compression)
        })?;
        Ok(())
    }
}

impl KafkaRequest for ProduceRequest {
    fn api_key(&self) -> i16 {
        API_KEY_PRODUCE
    }

    fn expects_response(&self) -> bool {
        self.required_acks != 0
    }
}

#[derive(Debug)]
struct TopicPartition {
    /// The topic name.
    name: String,
    /// Each partition to produce to.
    partitions: Vec<Partition>,
}

impl TopicPartition {
    fn new(name: &str) -> TopicPartition {
        TopicPartition {
            name: name.to_string(),
            partitions: vec![],
        }
    }

    fn add(&mut self, partition: i32, message: Message) {
        match self
            .partitions
            .iter_mut()
            .find(|p| p.partition == partition)
        {
            Some(p) => p.add(message),
            None => {
                let mut p = Partition::new(partition);
                p.add(message);
                self.partitions.push(p);
            }
        }
    }

    fn encode<W: BufMut>(&self, buffer: &mut W, codec: Compression) -> Result<()> {
        tracing::trace!("Encoding TopicPartition {:?}", self);
        self.name.encode(buffer)?;
        crate::encode::encode_as_array(buffer, &self.partitions, |buffer, p| {
            p.encode(buffer, codec)
        })?;
        Ok(())
    }
}

#[derive(Debug)]
struct Partition {
    /// The partition index.
    partition: i32,
    /// The record data to be produced. All records of one request land
    /// in a single batch.
    batches: Vec<RecordBatch>,
}

impl Partition {
    fn new(partition: i32) -> Partition {
        Partition {
            partition,
            batches: Vec::new(),
        }
    }

    fn add(&mut self, message: Message) {
        if self.batches.is_empty() {
            self.batches.push(RecordBatch::new(message.timestamp));
        }

        self.batches[0].add(message);
    }

    fn encode<W: BufMut>(&self, out: &mut W, codec: Compression) -> Result<()> {
        tracing::trace!("Encoding Partition {:?}", self);
        self.partition.encode(out)?;

        // the record set is a byte string, not a protocol array
        let mut buf = Vec::with_capacity(64);
        for batch in &self.batches {
            batch.encode_to_buf(&mut buf, codec)?;
        }

        buf.encode(out)
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    pub timestamp: i64,
}

// baseOffset: int64
// batchLength: int32
// partitionLeaderEpoch: int32
// magic: int8 (current magic value is 2)
// crc: uint32
// attributes: int16
//     bit 0~2:
//         0: no compression
//         1: gzip
//         2: snappy
//     bit 3~15: unused on produce
// lastOffsetDelta: int32
// baseTimestamp: int64
// maxTimestamp: int64
// producerId: int64
// producerEpoch: int16
// baseSequence: int32
// records: [Record]
#[derive(Debug)]
struct RecordBatch {
    base_offset: i64,
    partition_leader_epoch: i32,
    magic: i8,
    last_offset_delta: i32,
    base_timestamp: i64,
    max_timestamp: i64,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    records: Vec<Record>,
}

impl RecordBatch {
    fn new(base_timestamp: i64) -> Self {
        Self {
            base_offset: 0,
            partition_leader_epoch: -1,
            magic: MESSAGE_MAGIC_BYTE,
            last_offset_delta: -1,
            base_timestamp,
            max_timestamp: base_timestamp,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: Vec::new(),
        }
    }

    fn add(&mut self, message: Message) {
        self.last_offset_delta += 1;
        self.max_timestamp = self.max_timestamp.max(message.timestamp);

        let timestamp_delta = message.timestamp - self.base_timestamp;
        let offset_delta = self.last_offset_delta;

        self.records
            .push(Record::new(message, timestamp_delta, offset_delta as i64));
    }

    fn encode_to_buf(&self, out: &mut Vec<u8>, codec: Compression) -> Result<()> {
        self.base_offset.encode(out)?;

        // batch length prefix is supplied by the byte-string encode below
        let mut buf = Vec::with_capacity(64);
        self.partition_leader_epoch.encode(&mut buf)?;
        self.magic.encode(&mut buf)?;

        // crc placeholder, patched once the covered bytes are rendered
        let crc_pos = buf.len();
        0u32.encode(&mut buf)?;

        let attributes: i16 = Attributes::new(codec).into();
        attributes.encode(&mut buf)?;
        self.last_offset_delta.encode(&mut buf)?;
        self.base_timestamp.encode(&mut buf)?;
        self.max_timestamp.encode(&mut buf)?;
        self.producer_id.encode(&mut buf)?;
        self.producer_epoch.encode(&mut buf)?;
        self.base_sequence.encode(&mut buf)?;

        // the record count stays uncompressed; only the records
        // themselves run through the codec
        (self.records.len() as i32).encode(&mut buf)?;
        let mut records = Vec::with_capacity(64);
        for record in &self.records {
            record.encode(&mut records)?;
        }
        match codec {
            Compression::None => buf.extend_from_slice(&records),
            codec => {
                let compressed = compression::compress(&records, codec)?;
                buf.extend_from_slice(&compressed);
            }
        }

        let crc = to_crc(&buf[(crc_pos + 4)..]);
        crc.encode(&mut &mut buf[crc_pos..crc_pos + 4])?;

        buf.encode(out)?;

        Ok(())
    }
}

// length: varint
// attributes: int8
//     bit 0~7: unused
// timestampDelta: varlong
// offsetDelta: varint
// keyLength: varint
// key: byte[]
// valueLen: varint
// value: byte[]
// Headers => [Header]
//
// The record-level integers are all zigzag varints; a null key or
// value is length -1.
#[derive(Debug)]
struct Record {
    attributes: i8,
    timestamp_delta: i64,
    offset_delta: i64,
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<Header>,
}

impl Record {
    fn new(message: Message, timestamp_delta: i64, offset_delta: i64) -> Self {
        Self {
            attributes: 0,
            timestamp_delta,
            offset_delta,
            key: message.key,
            value: message.value,
            headers: message.headers,
        }
    }

    fn encode_to_buf(&self, out: &mut Vec<u8>) -> Result<()> {
        self.attributes.encode(out)?;
        encode_zigzag_varint(out, self.timestamp_delta);
        encode_zigzag_varint(out, self.offset_delta);

        encode_record_bytes(out, self.key.as_ref());
        encode_record_bytes(out, self.value.as_ref());

        encode_zigzag_varint(out, self.headers.len() as i64);
        for header in &self.headers {
            header.encode(out)?;
        }

        Ok(())
    }
}

impl ToByte for Record {
    fn encode<W: BufMut>(&self, out: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(32);
        self.encode_to_buf(&mut buf)?;

        // the record is a varint length followed by bytes
        encode_zigzag_varint(out, buf.len() as i64);
        out.put(buf.as_ref());

        Ok(())
    }
}

fn encode_record_bytes(out: &mut Vec<u8>, bytes: Option<&Bytes>) {
    match bytes {
        Some(bytes) => {
            encode_zigzag_varint(out, bytes.len() as i64);
            out.extend_from_slice(bytes);
        }
        None => encode_zigzag_varint(out, -1),
    }
}

// headerKeyLength: varint
// headerKey: String
// headerValueLength: varint
// Value: byte[]
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: String, value: Bytes) -> Self {
        Self { key, value }
    }
}

impl ToByte for Header {
    fn encode<W: BufMut>(&self, out: &mut W) -> Result<()> {
        encode_zigzag_varint(out, self.key.len() as i64);
        out.put(self.key.as_bytes());
        encode_zigzag_varint(out, self.value.len() as i64);
        out.put(self.value.clone());
        Ok(())
    }
}
