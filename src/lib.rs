//! Submits spark batches to a Livy server with the JDWP agent enabled and
//! finds where a remote debugger can attach to the driver.
//!
//! The driver picks its debug port at startup, so the port is discovered by
//! following the batch to its YARN application, the current attempt of that
//! application, and finally the debug agent announcement in the driver log.

pub mod cluster;
pub mod cmd;
pub mod controller;
pub mod driver;
pub mod error;
pub mod http;
pub mod livy;
pub mod logging;
pub mod poll;
pub mod session;

pub use cluster::{current_attempt, AppAttempt, YarnClient, YarnService};
pub use cmd::{ArtifactRef, SubmissionParameter, SubmissionParameterBuilder};
pub use controller::{ControllerState, PipelineSettings, RemoteDebugJobController};
pub use driver::{DebugEndpoint, DriverLogSource};
pub use error::{DebugError, PipelineError, Stage};
pub use http::{HttpClient, HttpSettings};
pub use livy::{BatchId, BatchService, BatchState, BatchStatusResponse, LivyClient};
pub use poll::{resolve_application_id, RetryPolicy};
pub use session::SessionRegistry;
