//! Deserialize data from the bytecode protocol.
//!
//! The response-side counterparts to the encoders: fixed-width
//! big-endian integers, i16-length strings, i32-count arrays, and the
//! varint family used inside record batches, all as composable nom
//! parsers over [`NomBytes`].

use bytes::Bytes;
use nom::{
    bytes::complete::take,
    error::{ErrorKind, ParseError},
    multi::count,
    number::complete::{be_i16, be_i32},
    IResult,
};
use nombytes::NomBytes;
use num_traits::FromPrimitive;

use crate::error::KafkaCode;

/// Decode a broker error code, folding values this crate does not
/// recognise into `KafkaCode::Unknown`.
pub fn parse_kafka_code(s: NomBytes) -> IResult<NomBytes, KafkaCode> {
    let (s, code) = be_i16(s)?;
    Ok((s, KafkaCode::from_i16(code).unwrap_or(KafkaCode::Unknown)))
}

/// Decode an unsigned LEB128 varint.
pub fn take_varint<E>(input: NomBytes) -> IResult<NomBytes, u64, E>
where
    E: ParseError<NomBytes>,
{
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut rest = input;
    loop {
        let (next, chunk) = take::<usize, NomBytes, E>(1)(rest)?;
        let byte = chunk.to_bytes()[0];
        if shift >= 64 {
            return Err(nom::Err::Error(E::from_error_kind(
                next,
                ErrorKind::TooLarge,
            )));
        }
        value |= u64::from(byte & 0x7f) << shift;
        shift += 7;
        rest = next;
        if byte & 0x80 == 0 {
            return Ok((rest, value));
        }
    }
}

/// Decode a zigzag signed varint, the record-level integer encoding of
/// the v2 record batch format.
pub fn take_zigzag_varint<E>(input: NomBytes) -> IResult<NomBytes, i64, E>
where
    E: ParseError<NomBytes>,
{
    let (input, raw) = take_varint(input)?;
    Ok((input, ((raw >> 1) as i64) ^ -((raw & 1) as i64)))
}

/// Decode a non-null protocol string.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i16(s)?;
    let (s, value) = take(length.max(0) as usize)(s)?;
    Ok((s, value.into_bytes()))
}

/// Decode a protocol array, running `parser` once per element. A null
/// array (count -1) decodes like an empty one.
pub fn parse_array<O, E, F>(parser: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (input, length) = be_i32(input)?;
        count(parser, length.max(0) as usize)(input)
    }
}

/// Record-level array whose count is a zigzag varint.
pub fn parse_zigzag_array<O, E, F>(
    parser: F,
) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (input, length) = take_zigzag_varint(input)?;
        count(parser, length.max(0) as usize)(input)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn input(bytes: &'static [u8]) -> NomBytes {
        NomBytes::from(bytes)
    }

    #[test]
    fn kafka_codes_fall_back_to_unknown() {
        assert_eq!(
            parse_kafka_code(input(b"\x00\x06")).unwrap().1,
            KafkaCode::NotLeaderForPartition
        );
        assert_eq!(
            parse_kafka_code(input(b"\x7f\x00")).unwrap().1,
            KafkaCode::Unknown
        );
    }

    #[test]
    fn varints_decode_one_and_multi_byte_values() {
        assert_eq!(take_varint::<()>(input(b"\x05")).unwrap().1, 5);

        let (rest, value) = take_varint::<()>(input(b"\xac\x02\xff")).unwrap();
        assert_eq!(value, 300);
        assert_eq!(rest.to_bytes(), Bytes::from_static(b"\xff"));
    }

    #[test]
    fn varints_reach_high_u64_values() {
        assert_eq!(
            take_varint::<()>(input(b"\x80\x80\x80\x80\x80\x80\x80\x80\x01"))
                .unwrap()
                .1,
            1u64 << 56
        );
    }

    #[test]
    fn zigzag_varints_unfold_the_sign_bit() {
        assert_eq!(take_zigzag_varint::<()>(input(b"\x00")).unwrap().1, 0);
        assert_eq!(take_zigzag_varint::<()>(input(b"\x01")).unwrap().1, -1);
        assert_eq!(take_zigzag_varint::<()>(input(b"\x80\x01")).unwrap().1, 64);
        assert_eq!(take_zigzag_varint::<()>(input(b"\x81\x01")).unwrap().1, -65);
    }

    #[test]
    fn strings_leave_trailing_input_alone() {
        let (rest, name) = parse_string(input(b"\x00\x06broker!")).unwrap();
        assert_eq!(name, Bytes::from_static(b"broker"));
        assert_eq!(rest.to_bytes(), Bytes::from_static(b"!"));
    }

    #[test]
    fn arrays_run_the_element_parser_count_times() {
        let (_, codes) =
            parse_array(parse_kafka_code)(input(b"\x00\x00\x00\x02\x00\x00\x00\x05")).unwrap();
        assert_eq!(codes, vec![KafkaCode::None, KafkaCode::LeaderNotAvailable]);
    }

    #[test]
    fn null_array_decodes_empty() {
        let (_, codes) = parse_array(parse_kafka_code)(input(b"\xff\xff\xff\xff")).unwrap();
        assert!(codes.is_empty());
    }
}
