//! Service layer: rule catalog and engine, log materializer and
//! pre-extractor, agent runners, the analysis pipeline, the task scheduler,
//! the progress bus, and outbound notifications.

pub mod agents;
pub mod extractor;
pub mod materializer;
pub mod notify;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod rules;
pub mod workspace;
