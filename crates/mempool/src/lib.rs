//! Command queue and proposal trigger.
//!
//! Clients submit command hashes; the pool buffers them and signals a beat
//! once a full batch is waiting. The node then asks the pacemaker whether
//! this replica should propose; if not, the batch stays buffered for a
//! later beat. Decisions come back through [`CommandPool::on_finality`],
//! which resolves the submitter registered for the command.

mod state;

pub use state::{CommandPool, MempoolStats};
