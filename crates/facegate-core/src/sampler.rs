/// Decides which incoming frames are sent to the (expensive) extractor.
///
/// Unthrottled, every frame is sampled. Throttled, only every Nth frame is.
/// The session throttles once a face is continuously present and the
/// liveness challenge needs no more dense samples.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    every_n: u32,
    since_last: u32,
    frames_seen: u64,
    frames_sampled: u64,
}

impl FrameSampler {
    pub fn new(every_n: u32) -> Self {
        Self {
            every_n: every_n.max(1),
            since_last: 0,
            frames_seen: 0,
            frames_sampled: 0,
        }
    }

    pub fn reset(&mut self) {
        self.since_last = 0;
        self.frames_seen = 0;
        self.frames_sampled = 0;
    }

    /// Register one incoming frame and report whether to extract it.
    pub fn should_sample(&mut self, throttled: bool) -> bool {
        self.frames_seen += 1;
        let sample = if throttled {
            self.since_last += 1;
            self.since_last >= self.every_n
        } else {
            true
        };
        if sample {
            self.since_last = 0;
            self.frames_sampled += 1;
        }
        sample
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn frames_sampled(&self) -> u64 {
        self.frames_sampled
    }
}
