//! Locate the coordinator broker of a consumer group.

pub mod request;
pub mod response;

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use nombytes::NomBytes;

    use super::*;
    use crate::{encode::ToByte, error::KafkaCode};

    #[test]
    fn encode() {
        let request = request::FindCoordinatorRequest::new(1, "rust", "accountants");
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();

        assert_eq!(
            buffer,
            [
                0, 10, // api key
                0, 0, // api version
                0, 0, 0, 1, // correlation id
                0, 4, 114, 117, 115, 116, // client id
                0, 11, 97, 99, 99, 111, 117, 110, 116, 97, 110, 116, 115, // "accountants"
            ]
        );
    }

    #[test]
    fn parse() {
        let buf = [
            0, 0, 0, 1, // correlation id
            0, 0, // error code
            0, 0, 0, 2, // node id
            0, 9, 108, 111, 99, 97, 108, 104, 111, 115, 116, // "localhost"
            0, 0, 35, 133, // port 9093
        ];

        let (_, parsed) =
            response::parse_find_coordinator_response(NomBytes::from(buf.as_slice())).unwrap();

        assert_eq!(parsed.error_code, KafkaCode::None);
        assert_eq!(parsed.node_id, 2);
        assert_eq!(parsed.host, Bytes::from("localhost"));
        assert_eq!(parsed.port, 9093);
    }
}
