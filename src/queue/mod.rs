pub mod retry;
pub mod storage;

pub use retry::{run_drain_loop, Deliver, DrainReport, RetryQueue};
pub use storage::{FsStorage, Storage};
