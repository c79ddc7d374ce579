//! Record batch compression codecs.
//!
//! The record batch header stays uncompressed on the wire; only the
//! records section is run through the codec named in the batch
//! attributes.
use std::io::Read;

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder};

use crate::error::{Error, Result};

/// Compression codec of a record batch, carried in bits 0-2 of the
/// batch attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
}

impl Compression {
    pub fn from_attributes(attributes: i16) -> Option<Self> {
        match attributes & 0b111 {
            0 => Some(Compression::None),
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Snappy),
            _ => None,
        }
    }

    pub fn to_attributes(self) -> i16 {
        self as i16
    }
}

pub fn compress(data: &[u8], codec: Compression) -> Result<Bytes> {
    match codec {
        Compression::None => Ok(Bytes::copy_from_slice(data)),
        Compression::Gzip => {
            use std::io::Write;
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(|err| {
                tracing::error!("Error compressing with GZIP {:?}", err);
                Error::CompressionError
            })?;
            let compressed = encoder.finish().map_err(|err| {
                tracing::error!("Error compressing with GZIP {:?}", err);
                Error::CompressionError
            })?;
            Ok(Bytes::from(compressed))
        }
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new().compress_vec(data).map_err(|err| {
                tracing::error!("Error compressing with Snappy {:?}", err);
                Error::CompressionError
            })?;
            Ok(Bytes::from(compressed))
        }
    }
}

pub fn decompress(data: &[u8], codec: Compression) -> Result<Bytes> {
    match codec {
        Compression::None => Ok(Bytes::copy_from_slice(data)),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed).map_err(|err| {
                tracing::error!("Error decompressing with GZIP {:?}", err);
                Error::CompressionError
            })?;
            Ok(Bytes::from(decompressed))
        }
        Compression::Snappy => {
            let decompressed = snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|err| {
                    tracing::error!("Error decompressing with Snappy {:?}", err);
                    Error::CompressionError
                })?;
            Ok(Bytes::from(decompressed))
        }
    }
}
