pub mod block;
pub mod store;

pub use block::{Block, BlockPart};
pub use store::{BlockStore, BlockStoreError};
