//! cellgrid-stager — staging over the message bus.
//!
//! A stager listens for `<topic>.start` messages, turns each into a task in
//! the `staging` domain and, when that task completes, publishes exactly one
//! `<topic>.finished` reply and deletes the task.
//!
//! # Components
//!
//! - **`bus`** — In-process publish/subscribe on a tokio broadcast channel
//! - **`message`** — Request and reply bodies, and the staging task builder
//! - **`stager`** — Start handling, completion handling and the run loop

pub mod bus;
pub mod error;
pub mod message;
pub mod stager;

pub use bus::{Message, MessageBus, Subscription};
pub use error::{StagerError, StagerResult};
pub use message::{
    Buildpack, STAGING_DOMAIN, StagingAnnotation, StagingRequest, StagingResponse, staging_task,
};
pub use stager::Stager;
