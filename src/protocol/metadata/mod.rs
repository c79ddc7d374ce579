//! Discover brokers, topics, and partition leadership.

pub mod request;
pub mod response;

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use nombytes::NomBytes;

    use super::*;
    use crate::{encode::ToByte, error::KafkaCode, protocol};

    #[test]
    fn encode() {
        let topics = [String::from("purchases")];
        let metadata_request = request::MetadataRequest::new(1, "rust", &topics);
        let mut buffer = Vec::new();
        metadata_request.encode(&mut buffer).unwrap();

        assert_eq!(
            buffer,
            [
                0, 3, // api key
                0, 0, // api version
                0, 0, 0, 1, // correlation id
                0, 4, 114, 117, 115, 116, // client id
                0, 0, 0, 1, // topics array len
                0, 9, 112, 117, 114, 99, 104, 97, 115, 101, 115, // "purchases"
            ]
        );
    }

    #[test]
    fn parse() {
        let buf = [
            0, 0, 0, 1, // correlation id
            0, 0, 0, 1, // broker array len
            0, 0, 0, 0, // node id
            0, 9, 108, 111, 99, 97, 108, 104, 111, 115, 116, // "localhost"
            0, 0, 35, 132, // port 9092
            0, 0, 0, 1, // topic array len
            0, 0, // topic error code
            0, 9, 112, 117, 114, 99, 104, 97, 115, 101, 115, // "purchases"
            0, 0, 0, 1, // partition array len
            0, 0, // partition error code
            0, 0, 0, 2, // partition index
            0, 0, 0, 0, // leader id
            0, 0, 0, 1, // replicas array len
            0, 0, 0, 0, // replica node
            0, 0, 0, 1, // isr array len
            0, 0, 0, 0, // isr node
        ];

        let (_, parsed) =
            response::parse_metadata_response(NomBytes::from(buf.as_slice())).unwrap();

        assert_eq!(
            parsed,
            response::MetadataResponse {
                header_response: protocol::HeaderResponse { correlation_id: 1 },
                brokers: vec![response::Broker {
                    node_id: 0,
                    host: Bytes::from("localhost"),
                    port: 9092,
                }],
                topics: vec![response::Topic {
                    error_code: KafkaCode::None,
                    name: Bytes::from("purchases"),
                    partitions: vec![response::Partition {
                        error_code: KafkaCode::None,
                        partition_index: 2,
                        leader_id: 0,
                        replica_nodes: vec![0],
                        isr_nodes: vec![0],
                    }],
                }],
            }
        );
    }
}
