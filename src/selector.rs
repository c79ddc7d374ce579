//! Partition selection for keyless and keyed records.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

use crate::{
    error::{Error, Result},
    router::TopicMetadata,
    utils::to_crc,
};

/// Picks the partition a record lands on when the caller named none.
///
/// The router holds one selector and consults it for every keyed
/// lookup, so implementations must be safe to share across tasks.
pub trait PartitionSelector: Send + Sync {
    fn select(&self, topic: &TopicMetadata, key: Option<&Bytes>) -> Result<i32>;
}

/// Round-robin for empty keys, CRC-32 hash modulo partition count
/// otherwise.
///
/// Keyless records rotate over the partitions that currently have a
/// valid leader; keyed records hash over the full partition list so a
/// key keeps landing on the same partition across leader elections.
#[derive(Debug, Default)]
pub struct DefaultPartitionSelector {
    cursor: AtomicUsize,
}

impl PartitionSelector for DefaultPartitionSelector {
    fn select(&self, topic: &TopicMetadata, key: Option<&Bytes>) -> Result<i32> {
        if topic.partitions.is_empty() {
            return Err(Error::CachedMetadata {
                topic: topic.name.clone(),
                partition: None,
            });
        }

        match key {
            Some(key) if !key.is_empty() => {
                let index = to_crc(key) as usize % topic.partitions.len();
                Ok(topic.partitions[index].id)
            }
            _ => {
                let routable: Vec<_> = topic
                    .partitions
                    .iter()
                    .filter(|partition| partition.leader_id >= 0)
                    .collect();
                if routable.is_empty() {
                    return Err(Error::CachedMetadata {
                        topic: topic.name.clone(),
                        partition: None,
                    });
                }
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % routable.len();
                Ok(routable[index].id)
            }
        }
    }
}
