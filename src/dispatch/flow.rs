//! Read-side flow control for one request
//!
//! Two independent mechanisms live here. Explicit pauses are counted so
//! nested pause/resume pairs from different parties balance out. Implicit
//! backpressure counts unacknowledged data messages and pauses reads once
//! the client falls too far behind, resuming when its acks drain the
//! backlog below the watermark.

/// Unacked data messages allowed before reads are paused
pub const MAX_PENDING_DATA_MESSAGES: usize = 20;

/// Effect of a pause-count adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseAdjust {
    /// The request transitioned to paused
    Paused,
    /// The count hit zero while paused; the caller schedules a resume
    ScheduleResume,
    /// No transition (already paused deeper, or an unbalanced resume)
    Unbalanced,
}

/// Per-request pause and backpressure state.
#[derive(Debug, Default)]
pub struct FlowController {
    pause_count: i32,
    is_paused: bool,
    has_started_reading: bool,
    /// Chunk that arrived while paused, replayed on resume
    parked_chunk: Option<Vec<u8>>,
    /// Response head arrived while paused; redelivered on resume
    parked_response: bool,
    pending_data_messages: usize,
}

impl FlowController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one pause (`true`) or resume (`false`) vote.
    ///
    /// A resume below zero is clamped and reported as `Unbalanced`; the
    /// caller logs it and carries on.
    pub fn adjust(&mut self, pause: bool) -> PauseAdjust {
        if pause {
            self.pause_count += 1;
            if !self.is_paused {
                self.is_paused = true;
                return PauseAdjust::Paused;
            }
            return PauseAdjust::Unbalanced;
        }

        if self.pause_count == 0 {
            log::warn!("resume with no outstanding pauses; ignoring");
            return PauseAdjust::Unbalanced;
        }
        self.pause_count -= 1;
        if self.pause_count == 0 && self.is_paused {
            PauseAdjust::ScheduleResume
        } else {
            PauseAdjust::Unbalanced
        }
    }

    /// Force the paused flag on without touching the vote count. Used to
    /// break out of a synchronous read loop; the caller posts itself a
    /// resume to pick the loop back up on a fresh stack.
    pub fn force_pause(&mut self) {
        self.is_paused = true;
    }

    /// Pause delivery if any votes are outstanding. Returns true when the
    /// caller must park the current event instead of delivering it.
    pub fn pause_if_needed(&mut self) -> bool {
        if self.pause_count > 0 {
            self.is_paused = true;
        }
        self.is_paused
    }

    pub fn mark_resumed(&mut self) {
        self.is_paused = false;
    }

    pub fn mark_reading(&mut self) {
        self.has_started_reading = true;
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn pause_count(&self) -> i32 {
        self.pause_count
    }

    pub fn has_started_reading(&self) -> bool {
        self.has_started_reading
    }

    pub fn park_chunk(&mut self, chunk: Vec<u8>) {
        self.parked_chunk = Some(chunk);
    }

    pub fn take_parked_chunk(&mut self) -> Option<Vec<u8>> {
        self.parked_chunk.take()
    }

    pub fn has_parked_chunk(&self) -> bool {
        self.parked_chunk.is_some()
    }

    pub fn park_response(&mut self) {
        self.parked_response = true;
    }

    pub fn take_parked_response(&mut self) -> bool {
        std::mem::take(&mut self.parked_response)
    }

    /// Record one data message sent to the client. Returns true once the
    /// backlog exceeds the watermark and the request should gain a pause
    /// vote.
    pub fn record_data_sent(&mut self) -> bool {
        self.pending_data_messages += 1;
        self.pending_data_messages > MAX_PENDING_DATA_MESSAGES
    }

    /// Record one data ack from the client. Returns true when the backlog
    /// just dropped back to the watermark and the pause vote taken at the
    /// crossing should be released.
    pub fn record_data_ack(&mut self) -> bool {
        if self.pending_data_messages == 0 {
            log::warn!("data ack with no outstanding data messages");
            return false;
        }
        self.pending_data_messages -= 1;
        if self.pending_data_messages == MAX_PENDING_DATA_MESSAGES {
            // The message that crossed the watermark is also being acked.
            self.pending_data_messages -= 1;
            return true;
        }
        false
    }

    pub fn pending_data_messages(&self) -> usize {
        self.pending_data_messages
    }
}
