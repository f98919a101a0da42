// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event emission with criticality routing from config.

use crate::transcript::{Transcript, TranscriptError};
use spindle_config::EventsConfig;

/// Emits events to a transcript, routing by configured criticality.
///
/// Critical events propagate write failures to the caller; droppable and
/// important events are best-effort (a failed write is logged, execution
/// continues). Every write is line-flushed either way.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    events: EventsConfig,
}

impl EventEmitter {
    /// Build an emitter with the cascaded events config.
    #[must_use]
    pub fn new(events: EventsConfig) -> Self {
        Self { events }
    }

    /// Criticality for an event type.
    #[must_use]
    pub fn criticality(&self, event_type: &str) -> &str {
        self.events.criticality(event_type)
    }

    /// Emit with the configured criticality.
    ///
    /// # Errors
    ///
    /// Only critical events surface [`TranscriptError`].
    pub fn emit(
        &self,
        transcript: &Transcript,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), TranscriptError> {
        if self.criticality(event_type) == "critical" {
            self.emit_critical(transcript, event_type, payload)
        } else {
            self.emit_droppable(transcript, event_type, payload);
            Ok(())
        }
    }

    /// Emit an event whose loss would corrupt the record; failures surface.
    ///
    /// # Errors
    ///
    /// [`TranscriptError`] on write failure.
    pub fn emit_critical(
        &self,
        transcript: &Transcript,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), TranscriptError> {
        transcript.write_event(event_type, payload)
    }

    /// Emit a best-effort event; failures are logged and swallowed.
    pub fn emit_droppable(
        &self,
        transcript: &Transcript,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        if let Err(e) = transcript.write_event(event_type, payload) {
            tracing::warn!(
                target: "spindle.transcript",
                thread_id = transcript.thread_id(),
                event_type,
                error = %e,
                "dropped transcript event"
            );
        }
    }
}
