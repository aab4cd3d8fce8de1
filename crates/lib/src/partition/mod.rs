//! Partition addressing and input-to-output partition mappings.

pub mod key;
pub mod mapping;

pub use key::{PartitionDims, PartitionFilter, PartitionKey, PartitionKeyError};
pub use mapping::{InputPartitions, MapFn, PartitionDependencies, PartitionMapper, PartitionMapping};
