//! Mapping of task priorities onto broker links.
//!
//! Brokers cap the number of priority levels a single queue honours. To offer
//! a wider priority range, each partition is backed by several physical queues
//! ("shards"), each covering [`MAX_INTERNAL_QUEUE_PRIORITY`] consecutive
//! priorities. A priority selects the shard `priority / 10` and is sent with
//! the shard-local priority `priority % 10`.
//!
//! Partitions backed by a single shard use the historical link names without
//! a shard index (`{partition}###SenderLink`, `{partition}###q`), so existing
//! broker topologies keep working unchanged.

use std::fmt;

#[cfg(test)]
#[path = "sharding_tests.rs"]
mod tests;

/// Number of priority levels a single broker queue honours (0-9)
pub const MAX_INTERNAL_QUEUE_PRIORITY: u32 = 10;

const NAME_SEPARATOR: &str = "###";

/// Number of shards needed to cover priorities up to `max_priority`.
///
/// Never less than one.
pub fn links_per_partition(max_priority: u32) -> u32 {
    max_priority
        .div_ceil(MAX_INTERNAL_QUEUE_PRIORITY)
        .max(1)
}

/// Physical placement of a priority within a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardAssignment {
    /// Index of the shard, in `0..links_per_partition`
    pub link_index: u32,
    /// Priority carried in the message header, in `0..=9`
    pub local_priority: u8,
}

/// Place `priority` on one of the `links_per_partition` shards.
///
/// Priorities past the last shard's range (`priority == max_priority` when
/// `max_priority` is a multiple of ten) stay on the last shard with the
/// highest local priority.
pub fn assign(priority: u32, links_per_partition: u32) -> ShardAssignment {
    let last_link = links_per_partition.max(1) - 1;
    let link_index = (priority / MAX_INTERNAL_QUEUE_PRIORITY).min(last_link);
    let local = priority - link_index * MAX_INTERNAL_QUEUE_PRIORITY;

    ShardAssignment {
        link_index,
        local_priority: local.min(MAX_INTERNAL_QUEUE_PRIORITY - 1) as u8,
    }
}

/// Names of the links and queue backing one shard of a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkNames {
    pub sender: String,
    pub receiver: String,
    pub queue: String,
}

impl LinkNames {
    /// Names for shard `link_index` of `partition_id`.
    pub fn for_shard(partition_id: &str, link_index: u32, links_per_partition: u32) -> Self {
        let prefix = if links_per_partition <= 1 {
            format!("{partition_id}{NAME_SEPARATOR}")
        } else {
            format!("{partition_id}{NAME_SEPARATOR}{link_index}{NAME_SEPARATOR}")
        };

        Self {
            sender: format!("{prefix}SenderLink"),
            receiver: format!("{prefix}ReceiverLink"),
            queue: format!("{prefix}q"),
        }
    }

    /// Names for every shard of `partition_id`, lowest priority first.
    pub fn for_partition(partition_id: &str, links_per_partition: u32) -> Vec<Self> {
        (0..links_per_partition.max(1))
            .map(|index| Self::for_shard(partition_id, index, links_per_partition))
            .collect()
    }
}

impl fmt::Display for LinkNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.queue)
    }
}
