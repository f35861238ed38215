//! ID types minted by the controller.

use crate::define_id;

define_id!(
    /// A unit of queued work.
    TaskId,
    "task"
);

define_id!(
    /// A group of tasks submitted together by an operator.
    BatchTaskId,
    "batch"
);

define_id!(
    /// One reservation of a task by a worker; the holder of its locks.
    ReservationId,
    "rsv"
);
