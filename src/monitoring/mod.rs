//! Run Monitoring Module
//!
//! Utilities for tracking the timeline of workflow runs.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for durations and Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
