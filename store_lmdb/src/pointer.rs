//! LMDB implementation of PointerStore.
//!
//! The pointer is a single bincode document in the meta database.

use tally_store::pointer::PointerStore;
use tally_store::StoreError;
use tally_types::BlockPointer;

use crate::{LmdbEnvironment, LmdbError};

const BLOCK_POINTER_KEY: &[u8] = b"block_pointer";

impl PointerStore for LmdbEnvironment {
    fn get_block_pointer(&self) -> Result<Option<BlockPointer>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let val = self
            .meta_db
            .get(&rtxn, BLOCK_POINTER_KEY)
            .map_err(LmdbError::from)?;
        match val {
            Some(bytes) => {
                let pointer: BlockPointer =
                    bincode::deserialize(bytes).map_err(LmdbError::from)?;
                Ok(Some(pointer))
            }
            None => Ok(None),
        }
    }

    fn put_block_pointer(&self, pointer: &BlockPointer) -> Result<(), StoreError> {
        let bytes = bincode::serialize(pointer).map_err(LmdbError::from)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.meta_db
            .put(&mut wtxn, BLOCK_POINTER_KEY, &bytes)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }
}
