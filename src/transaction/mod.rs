//! Per-transaction buffering of change records between parse and commit.

mod buffer;

pub use buffer::{
    AppendOutcome, OpenXid, Transaction, TransactionBuffer, TransactionReplay, TxState,
    CHUNK_HEADER_SIZE,
};
