//! Rolling job-arrival statistics.
//!
//! Five one-minute buckets tracking how often the pool hands out work.
//! The sender uses the average inter-job interval to judge whether task
//! pacing or the pool is the bottleneck; the API reports the raw numbers.

use std::time::Duration;

/// Number of one-minute buckets.
pub const JOB_BUCKETS: usize = 5;

/// A silence this long (minutes) resets the history; either every pool was
/// lost or the device was powered down.
pub const JOB_LIMIT_MINS: u64 = 3;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    first: Option<Duration>,
    last: Option<Duration>,
    jobs: u32,
    /// Running average of milliseconds between jobs inside this minute.
    avg_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

/// Per-minute job-interval window.
#[derive(Debug, Default)]
pub struct JobBuckets {
    /// Minute corresponding to `buckets[offset]`.
    zeromin: u64,
    offset: usize,
    buckets: [Bucket; JOB_BUCKETS],
    last_job: Option<Duration>,
    started: bool,
}

/// Summary over the whole window, as exposed through the API.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobSummary {
    pub jobs: u32,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl JobBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a job handed to the device at monotonic time `now`.
    pub fn add_job(&mut self, now: Duration) {
        let min = now.as_secs() / 60;
        self.roll_to(min);

        let gap_ms = self
            .last_job
            .map(|prev| (now.saturating_sub(prev)).as_secs_f64() * 1000.0);
        self.last_job = Some(now);

        let bucket = &mut self.buckets[self.offset];
        bucket.jobs += 1;
        bucket.last = Some(now);
        if bucket.first.is_none() {
            bucket.first = Some(now);
        }

        if let Some(ms) = gap_ms {
            if bucket.avg_ms == 0.0 {
                bucket.avg_ms = ms;
                bucket.min_ms = ms;
                bucket.max_ms = ms;
            } else {
                let n = bucket.jobs as f64;
                bucket.avg_ms += (ms - bucket.avg_ms) / n;
                bucket.min_ms = bucket.min_ms.min(ms);
                bucket.max_ms = bucket.max_ms.max(ms);
            }
        }
    }

    fn roll_to(&mut self, min: u64) {
        if !self.started {
            self.started = true;
            self.zeromin = min;
            return;
        }
        if min == self.zeromin {
            return;
        }
        if min < self.zeromin || min - self.zeromin > JOB_LIMIT_MINS {
            self.reset();
            self.started = true;
            self.zeromin = min;
            return;
        }
        for _ in 0..(min - self.zeromin) {
            self.offset = (self.offset + 1) % JOB_BUCKETS;
            self.buckets[self.offset] = Bucket::default();
        }
        self.zeromin = min;
    }

    /// Aggregate over every bucket currently in the window.
    pub fn summary(&self) -> JobSummary {
        let mut out = JobSummary::default();
        let mut weighted = 0.0;
        let mut intervals = 0u32;

        for b in &self.buckets {
            if b.jobs == 0 {
                continue;
            }
            out.jobs += b.jobs;
            if b.avg_ms > 0.0 {
                // intervals per bucket: every job except the bucket's first
                // contributes one
                let n = b.jobs.saturating_sub(1).max(1);
                weighted += b.avg_ms * n as f64;
                intervals += n;
                if out.min_ms == 0.0 || b.min_ms < out.min_ms {
                    out.min_ms = b.min_ms;
                }
                out.max_ms = out.max_ms.max(b.max_ms);
            }
        }
        if intervals > 0 {
            out.avg_ms = weighted / intervals as f64;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[test]
    fn counts_jobs_per_window() {
        let mut jb = JobBuckets::new();
        for i in 0..10 {
            jb.add_job(at(i * 2));
        }
        let s = jb.summary();
        assert_eq!(s.jobs, 10);
        assert!((s.avg_ms - 2000.0).abs() < 1.0, "avg {}", s.avg_ms);
        assert_eq!(s.min_ms, 2000.0);
        assert_eq!(s.max_ms, 2000.0);
    }

    #[test]
    fn long_silence_resets_history() {
        let mut jb = JobBuckets::new();
        for i in 0..5 {
            jb.add_job(at(i));
        }
        // four minutes later, the window starts over
        jb.add_job(at(4 * 60));
        assert_eq!(jb.summary().jobs, 1);
    }

    #[test]
    fn window_spans_five_minutes() {
        let mut jb = JobBuckets::new();
        // one job per minute for eight minutes, always within the gap limit
        for m in 0..8 {
            jb.add_job(at(m * 60));
        }
        // only the five newest minutes remain
        assert_eq!(jb.summary().jobs, 5);
    }

    #[test]
    fn tracks_min_and_max_intervals() {
        let mut jb = JobBuckets::new();
        jb.add_job(at(0));
        jb.add_job(at(1));
        jb.add_job(at(4));
        let s = jb.summary();
        assert_eq!(s.min_ms, 1000.0);
        assert_eq!(s.max_ms, 3000.0);
    }
}
