//! Commonly used types and traits

pub use crate::collaborators::{
    DeliveryStatusSource, EmailSender, MessageId, MovieInfo, MovieInfoProvider, SummaryGenerator,
};
pub use crate::context::{Event, RunContext, RunId, RunState};
pub use crate::delivery::{DeliveryState, DeliveryStatus, DeliveryTracker};
pub use crate::dispatcher::{DispatchConfig, EventDispatcher, TriggerPayload};
pub use crate::error::{CollaboratorError, FailureReason, StepError, ValidationError};
pub use crate::memo::StepMemo;
pub use crate::outcome::{InMemoryOutcomeLog, OutcomeLog, OutcomeRecord};
pub use crate::retry::{DefaultClassifier, FailureKind, RetryClassifier, RetryPolicy};
pub use crate::runner::StepRunner;
pub use crate::step::{StepName, StepStatus};
pub use crate::workflow::WorkflowEngine;
