//! Task failure classification.

use thiserror::Error;
use vnet_id::TaskId;
use vnet_networking::CidrError;

use crate::carrier::CarrierError;
use crate::cloud::CloudError;
use crate::ipam::IpamError;
use crate::model::TaskStatus;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Why a task did not succeed.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task was rejected before anything was changed.
    #[error("{0}")]
    Precondition(String),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    #[error("carrier error: {0}")]
    Carrier(#[from] CarrierError),

    #[error("state store error: {0}")]
    Store(StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cidr(#[from] CidrError),

    /// The task was cancelled while running. Its status is already terminal.
    #[error("task was cancelled")]
    Cancelled,

    #[error("Prerequisite task \"{0}\" did not succeed")]
    Prerequisite(TaskId),

    /// The persisted state would violate a structural invariant.
    #[error("state invariant violated: {0}")]
    Invariant(String),

    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<TaskError>,
    },
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotInProgress {
                status: TaskStatus::Cancelled,
                ..
            } => Self::Cancelled,
            other => Self::Store(other),
        }
    }
}

impl TaskError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// True if the task was cancelled, looking through step wrappers.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_precondition(&self) -> bool {
        match self {
            Self::Precondition(_) => true,
            Self::Step { source, .. } => source.is_precondition(),
            _ => false,
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Adds a step description to an error on its way up.
pub trait StepContext<T> {
    fn step(self, step: impl Into<String>) -> TaskResult<T>;
}

impl<T, E> StepContext<T> for Result<T, E>
where
    E: Into<TaskError>,
{
    fn step(self, step: impl Into<String>) -> TaskResult<T> {
        self.map_err(|e| match e.into() {
            TaskError::Cancelled => TaskError::Cancelled,
            source => TaskError::Step {
                step: step.into(),
                source: Box::new(source),
            },
        })
    }
}
