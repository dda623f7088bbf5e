//! Block pointer storage trait.

use crate::StoreError;
use tally_types::BlockPointer;

/// Storage for the singleton "last processed block" pointer.
pub trait PointerStore {
    /// The persisted pointer, or `None` before the first pass seeds it.
    fn get_block_pointer(&self) -> Result<Option<BlockPointer>, StoreError>;

    /// Insert or overwrite the pointer.
    fn put_block_pointer(&self, pointer: &BlockPointer) -> Result<(), StoreError>;
}
