//! The work dispatcher: admission, routing to render agents, job status and
//! resolution of delegated conversions.

pub mod dispatcher;
pub mod events;
pub mod ledger;

pub use dispatcher::{
    Dispatcher, DispatcherBuilder, EncoderNotification, EncoderState, JobReport, RecoveryReport,
    Resolution, SubmitRequest,
};
pub use events::{JobEvent, JobEventBroadcaster};
pub use ledger::{JobLedger, Transition};
