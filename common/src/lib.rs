// Agora common library - main library exports

pub mod balance;
pub mod byte_array;
pub mod hash;
pub mod messages;
pub mod queries;
pub mod types;

// Flattened re-exports
pub use self::balance::{BalanceDiff, TransactionWithChanges};
pub use self::byte_array::Address;
pub use self::hash::{AssetId, BlockId, Hash, TxId};
pub use self::types::*;
