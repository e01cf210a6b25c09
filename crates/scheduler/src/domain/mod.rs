pub mod deleter;
pub mod offers;
pub mod podtask;
pub mod queue;
pub mod reconcile;
pub mod schedule;
pub mod scheduler;
pub mod traits;
