//! Parsing and processing for Fetch responses.

use bytes::Bytes;
use nom::{
    bytes::complete::take,
    combinator::{complete, rest},
    error::ParseError,
    multi::{many0, many_m_n},
    number::complete::{be_i16, be_i32, be_i64, be_i8, be_u32},
    IResult,
};
use nombytes::NomBytes;

use crate::{
    compression::{self, Compression},
    error::{Error, KafkaCode, Result},
    parser,
    protocol::{parse_header_response, produce::request::Attributes, HeaderResponse, KafkaResponse},
};

/*
Fetch Response (Version: 4) => throttle_time_ms [responses]
  throttle_time_ms => INT32
  responses => topic [partitions]
    topic => STRING
    partitions => partition_index error_code high_watermark last_stable_offset [aborted_transactions] records
      partition_index => INT32
      error_code => INT16
      high_watermark => INT64
      last_stable_offset => INT64
      aborted_transactions => producer_id first_offset
        producer_id => INT64
        first_offset => INT64
      records => RECORD BATCH

The record batch layout is the v2 format also used on produce; see the
produce request module. When compression is enabled the batch header and
the record count stay uncompressed while the records themselves are run
through the codec. The record-level integers are zigzag varints.
*/

#[derive(Debug, Default, PartialEq)]
pub struct FetchResponse {
    pub header_response: HeaderResponse,
    /// The duration in milliseconds for which the request was throttled due to a quota violation, or zero if the request did not violate any quota.
    pub throttle_time: i32,
    /// The response topics.
    pub topics: Vec<Topic>,
}

impl FetchResponse {
    pub fn record_count(&self) -> usize {
        self.topics.iter().map(|topic| topic.record_count()).sum()
    }
}

// this helps us cast the server response into this type
impl TryFrom<Bytes> for FetchResponse {
    type Error = Error;

    fn try_from(s: Bytes) -> Result<Self> {
        tracing::trace!("Parsing FetchResponse {:?}", s);
        let (_, fetch_response) = parse_fetch_response(NomBytes::new(s.clone())).map_err(|err| {
            tracing::error!("ERROR: Failed parsing FetchResponse {:?}", err);
            tracing::error!("ERROR: FetchResponse Bytes {:?}", s);
            Error::ParsingError(s)
        })?;
        tracing::trace!("Parsed FetchResponse {:?}", fetch_response);
        Ok(fetch_response)
    }
}

impl KafkaResponse for FetchResponse {
    fn error_codes(&self) -> Vec<KafkaCode> {
        self.topics
            .iter()
            .flat_map(|topic| topic.partitions.iter().map(|p| p.error_code))
            .collect()
    }
}

/// The response topics.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub name: Bytes,
    pub partitions: Vec<Partition>,
}

impl Topic {
    pub fn record_count(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.record_count())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub id: i32,
    pub error_code: KafkaCode,
    pub high_water_mark: i64,
    pub last_stable_offset: i64,
    pub aborted_transactions: Vec<AbortedTransactions>,
    pub record_batch: Vec<RecordBatch>,
    /// The record set ended mid-batch: the broker had more data for
    /// this partition than `partition_max_bytes` allowed. With zero
    /// complete batches this means the next record does not fit the
    /// current fetch buffer.
    pub truncated: bool,
}

impl Partition {
    pub fn into_box_iter(self) -> Box<impl Iterator<Item = (i32, KafkaCode, i64, i64, Record)>> {
        Box::new(self.record_batch.into_iter().flat_map(move |batch| {
            batch.records.into_iter().map(move |record| {
                (
                    self.id,
                    self.error_code,
                    batch.base_offset,
                    batch.base_timestamp,
                    record,
                )
            })
        }))
    }

    pub fn record_count(&self) -> usize {
        self.record_batch
            .iter()
            .map(|batch| batch.record_count())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbortedTransactions {
    pub producer_id: i64,
    pub first_offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub batch_length: i32,
    pub partition_leader_epoch: i32,
    pub magic: i8,
    pub crc: u32,
    pub attributes: Attributes,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub attributes: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i64,
    pub key: Bytes,
    pub value: Bytes,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub key: Bytes,
    pub value: Bytes,
}

pub fn parse_fetch_response(s: NomBytes) -> IResult<NomBytes, FetchResponse> {
    let (s, header_response) = parse_header_response(s)?;
    let (s, throttle_time) = be_i32(s)?;
    let (s, topics) = parser::parse_array(parse_topic)(s)?;

    Ok((
        s,
        FetchResponse {
            header_response,
            throttle_time,
            topics,
        },
    ))
}

fn parse_topic(s: NomBytes) -> IResult<NomBytes, Topic> {
    let (s, name) = parser::parse_string(s)?;
    let (s, partitions) = parser::parse_array(parse_partition)(s)?;

    Ok((s, Topic { name, partitions }))
}

fn parse_partition(s: NomBytes) -> IResult<NomBytes, Partition> {
    let (s, id) = be_i32(s)?;
    let (s, error_code) = parser::parse_kafka_code(s)?;
    let (s, high_water_mark) = be_i64(s)?;
    let (s, last_stable_offset) = be_i64(s)?;
    let (s, aborted_transactions) = parser::parse_array(parse_aborted_transactions)(s)?;
    let (s, record_set_size) = be_i32(s)?;

    // The record set is scoped to its own size so a batch the broker
    // cut off at partition_max_bytes never bleeds into the next
    // partition. Whatever trailing bytes fail to parse as a complete
    // batch mark the partition truncated.
    let (s, record_set) = take(record_set_size.max(0) as usize)(s)?;
    let (leftover, record_batch) = many0(complete(parse_record_batch))(record_set)?;
    let truncated = !leftover.to_bytes().is_empty();

    Ok((
        s,
        Partition {
            id,
            error_code,
            high_water_mark,
            last_stable_offset,
            aborted_transactions,
            record_batch,
            truncated,
        },
    ))
}

fn parse_aborted_transactions(s: NomBytes) -> IResult<NomBytes, AbortedTransactions> {
    let (s, producer_id) = be_i64(s)?;
    let (s, first_offset) = be_i64(s)?;

    Ok((
        s,
        AbortedTransactions {
            producer_id,
            first_offset,
        },
    ))
}

pub fn parse_record_batch(s: NomBytes) -> IResult<NomBytes, RecordBatch> {
    let (s, base_offset) = be_i64(s)?;
    let (s, batch_length) = be_i32(s)?;
    // scope the batch body; an incomplete body stops batch parsing here
    let (s, body) = take(batch_length.max(0) as usize)(s)?;

    let (body, partition_leader_epoch) = be_i32(body)?;
    let (body, magic) = be_i8(body)?;
    let (body, crc) = be_u32(body)?;
    let (body, attributes) = be_i16(body)?;
    let compression = match Compression::from_attributes(attributes) {
        Some(compression) => compression,
        None => return Err(fail(body)),
    };
    let (body, last_offset_delta) = be_i32(body)?;
    let (body, base_timestamp) = be_i64(body)?;
    let (body, max_timestamp) = be_i64(body)?;
    let (body, producer_id) = be_i64(body)?;
    let (body, producer_epoch) = be_i16(body)?;
    let (body, base_sequence) = be_i32(body)?;
    let (body, record_count) = be_i32(body)?;
    let record_count = record_count.max(0) as usize;

    // When compression is enabled, the RecordBatch header remains
    // uncompressed, but the records are compressed together
    let records = match compression {
        Compression::None => {
            let (_, records) = many_m_n(record_count, record_count, parse_record)(body)?;
            records
        }
        codec => {
            tracing::debug!("Decompressing with {:?}", codec);
            let (trailing, compressed) = rest(body.clone())?;
            let record_bytes = match compression::decompress(&compressed.to_bytes(), codec) {
                Ok(record_bytes) => record_bytes,
                Err(_) => return Err(fail(trailing)),
            };
            let (_, records) =
                many_m_n(record_count, record_count, parse_record)(NomBytes::new(record_bytes))?;
            records
        }
    };

    Ok((
        s,
        RecordBatch {
            base_offset,
            batch_length,
            partition_leader_epoch,
            magic,
            crc,
            attributes: Attributes::new(compression),
            last_offset_delta,
            base_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            records,
        },
    ))
}

fn parse_record(s: NomBytes) -> IResult<NomBytes, Record> {
    let (s, _length) = parser::take_zigzag_varint(s)?;
    let (s, attributes) = be_i8(s)?;
    let (s, timestamp_delta) = parser::take_zigzag_varint(s)?;
    let (s, offset_delta) = parser::take_zigzag_varint(s)?;
    let (s, key) = parse_record_bytes(s)?;
    let (s, value) = parse_record_bytes(s)?;
    let (s, headers) = parser::parse_zigzag_array(parse_header)(s)?;

    Ok((
        s,
        Record {
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        },
    ))
}

/// A record-level byte string: zigzag varint length, -1 denoting null.
fn parse_record_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = parser::take_zigzag_varint(s)?;
    if length <= 0 {
        return Ok((s, Bytes::new()));
    }
    let (s, bytes) = take(length as usize)(s)?;
    Ok((s, bytes.into_bytes()))
}

fn parse_header(s: NomBytes) -> IResult<NomBytes, Header> {
    let (s, key) = parse_record_bytes(s)?;
    let (s, value) = parse_record_bytes(s)?;

    Ok((s, Header { key, value }))
}

fn fail(input: NomBytes) -> nom::Err<nom::error::Error<NomBytes>> {
    nom::Err::Error(nom::error::Error::from_error_kind(
        input,
        nom::error::ErrorKind::Verify,
    ))
}
