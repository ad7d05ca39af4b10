use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::Offset;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A partition together with the offset to resume from (commit, seek) or the
/// current consume position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    /// Builds from a topic partition list element, skipping logical offsets
    /// (beginning, end, stored, invalid) that carry no position.
    pub fn from_elem(elem: &TopicPartitionListElem<'_>) -> Option<Self> {
        match elem.offset() {
            Offset::Offset(offset) => Some(Self::new(
                Partition::new(elem.topic(), elem.partition()),
                offset,
            )),
            _ => None,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::TopicPartitionList;

    #[test]
    fn test_partition_offset_from_elem_skips_logical_offsets() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("events", 0, Offset::Offset(42))
            .unwrap();
        list.add_partition_offset("events", 1, Offset::Beginning)
            .unwrap();

        let offsets: Vec<PartitionOffset> = list
            .elements()
            .iter()
            .filter_map(PartitionOffset::from_elem)
            .collect();

        assert_eq!(
            offsets,
            vec![PartitionOffset::new(Partition::new("events", 0), 42)]
        );
    }

    #[test]
    fn test_display() {
        let offset = PartitionOffset::new(Partition::new("events", 3), 10);
        assert_eq!(offset.to_string(), "events:3@10");
    }
}
