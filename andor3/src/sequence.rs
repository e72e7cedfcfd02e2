//! Frame-number reconciliation across grabbed frames.

/// Acquisition parameters captured at recording start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SequenceParams {
    /// Free-running internal trigger: frame numbers can be estimated from
    /// hardware timestamps.
    pub auto_trigger: bool,
    pub frame_rate: f64,
    pub accumulate_count: i64,
    pub clock_frequency: u64,
}

/// Running frame-number state, reset at each recording start.
///
/// Under the free-running trigger the number of frames elapsed between
/// two hardware timestamps is estimated from the configured frame rate,
/// which makes dropped frames visible as jumps. Under software or
/// external triggering the frame rate is not authoritative, so the
/// counter simply increments per grabbed frame and drops go undetected.
#[derive(Debug, Default)]
pub(crate) struct FrameSequence {
    last_frame_number: u64,
    last_frame_clock: u64,
    frame_number: u64,
}

impl FrameSequence {
    pub fn advance(&mut self, timestamp: u64, params: &SequenceParams) -> u64 {
        if params.auto_trigger {
            if self.last_frame_number == 0 {
                self.last_frame_number = 1;
                self.last_frame_clock = timestamp;
                self.frame_number = 1;
            } else {
                let elapsed_ticks = timestamp.saturating_sub(self.last_frame_clock);
                let seconds = elapsed_ticks as f64 / params.clock_frequency as f64;
                let estimated = seconds * params.frame_rate / params.accumulate_count as f64;
                self.frame_number = self.last_frame_number + estimated as u64;
                self.last_frame_number = self.frame_number;
                self.last_frame_clock = timestamp;
            }
        } else {
            self.frame_number += 1;
        }
        self.frame_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTO: SequenceParams = SequenceParams {
        auto_trigger: true,
        frame_rate: 30.0,
        accumulate_count: 1,
        clock_frequency: 1_000_000,
    };

    #[test]
    fn auto_trigger_estimates_from_timestamps() {
        let mut seq = FrameSequence::default();
        assert_eq!(seq.advance(10_000, &AUTO), 1);
        // Half a second at 30 fps: 15 frames elapsed.
        assert_eq!(seq.advance(510_000, &AUTO), 16);
    }

    #[test]
    fn auto_trigger_truncates_partial_frames() {
        let mut seq = FrameSequence::default();
        seq.advance(0, &AUTO);
        // 1.99 frame periods elapse; only one whole frame counts.
        let dt = (1.99 / 30.0 * 1_000_000.0) as u64;
        assert_eq!(seq.advance(dt, &AUTO), 2);
    }

    #[test]
    fn accumulate_count_divides_the_rate() {
        let params = SequenceParams {
            accumulate_count: 3,
            ..AUTO
        };
        let mut seq = FrameSequence::default();
        seq.advance(0, &params);
        // One second at 30 fps accumulating 3: 10 output frames.
        assert_eq!(seq.advance(1_000_000, &params), 11);
    }

    #[test]
    fn backward_timestamp_does_not_regress() {
        let mut seq = FrameSequence::default();
        seq.advance(500_000, &AUTO);
        assert_eq!(seq.advance(400_000, &AUTO), 1);
        // The baseline moved; a later frame still advances.
        assert_eq!(seq.advance(440_000, &AUTO), 2);
    }

    #[test]
    fn other_triggers_count_grabs() {
        let params = SequenceParams {
            auto_trigger: false,
            ..AUTO
        };
        let mut seq = FrameSequence::default();
        for expected in 1..=5 {
            // Wildly uneven timestamps are ignored.
            assert_eq!(seq.advance(expected * 999_983, &params), expected);
        }
    }
}
