pub mod engine;
pub mod memory;

pub use engine::{
    Direction, PartitionCatalog, SchemaUpgrade, Substrate, SubstrateConnection, SubstrateCursor,
    SubstrateTransaction, TransactionMode,
};
pub use memory::MemorySubstrate;
