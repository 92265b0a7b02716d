//! Domain model: identifiers, task records, status machine, outcomes.

pub mod ids;
pub mod outcome;
pub mod status;
pub mod task;

pub use ids::{BlobId, InvalidDigest, TaskId, WorkerId};
pub use outcome::{Failure, TaskError, error_type};
pub use status::{TaskStatus, UnknownStatus};
pub use task::{Arg, Dependency, NewTask, Requirement, TaskDependency, TaskRecord, TaskSpec, reason};
