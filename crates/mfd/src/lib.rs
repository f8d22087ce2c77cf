pub mod errors;
pub mod header;
pub mod pool;
pub mod probe;
pub mod reader;
pub mod writer;

mod futex;
mod mapping;
mod notifier;

pub use errors::MfdError;
pub use header::USER_SLOTS;
pub use pool::{MfdPool, PoolSlot};
pub use probe::{MfdConfig, cpu_count, page_size};
pub use reader::MfdReader;
pub use writer::MfdWriter;
