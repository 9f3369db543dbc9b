// Source module - reading messages from the external log
pub mod kafka;
pub mod log;
pub mod memory;
pub mod reader;

// Public API
pub use kafka::KafkaLog;
pub use log::{LogReader, Watermarks};
pub use memory::MemoryLog;
pub use reader::{assign_partitions, PartitionReader, ReaderContext};
