//! Queue engine: populating the backlog, lease passes, worker population,
//! and the dispatcher that runs scheduled invocations.

pub mod dispatch;
pub mod populate;
pub mod population;
pub mod scheduler;
pub mod worker;

pub use dispatch::Dispatcher;
pub use populate::{Populator, TagFanout};
pub use population::{WorkerPopulation, purge_and_settle};
pub use scheduler::{QueueScheduler, Scheduler};
pub use worker::{FixedTagChooser, LeaseWorker, PassReport, PassState, RandomTagChooser, TagChooser};
