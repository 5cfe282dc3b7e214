//! Execution Timeline
//!
//! Tracks step lifecycle events for one run segment, used for the run
//! duration reported to analytics and the Gantt summary logged at debug
//! level. Timestamps come from the tokio clock so paused-time tests see
//! consistent durations.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step condition was false
    Skipped,
    /// Step is waiting for a missing input
    Paused,
}

impl EventType {
    fn ends_step(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Paused)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Number of events of one type.
    pub fn count(&self, event_type: EventType) -> usize {
        self.events.iter().filter(|e| e.event_type == event_type).count()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Start and end offsets in milliseconds for each step that finished.
    fn spans(&self) -> Vec<(String, u128, u128)> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type == EventType::Started {
                starts.insert(&event.step_id, at);
            } else if event.event_type.ends_step() {
                if let Some(start) = starts.remove(event.step_id.as_str()) {
                    spans.push((event.step_id.clone(), start, at));
                }
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Generates an ASCII Gantt chart of the steps that ran.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (step_id, start, end) in self.spans() {
            let start_pos = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;
            output.push_str(&format!(
                "{:12} |{}{}| ({} ms)\n",
                truncate(&step_id, 12),
                " ".repeat(start_pos),
                "#".repeat(width),
                end - start
            ));
        }

        let skipped = self.count(EventType::Skipped);
        if skipped > 0 {
            output.push_str(&format!("\nSkipped: {}\n", skipped));
        }
        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
