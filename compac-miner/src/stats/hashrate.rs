//! Rolling hash-rate estimation from nonce arrivals.
//!
//! A fixed ring of one-second buckets covering the last five minutes. Each
//! nonce lands in the bucket for its arrival second, weighted by the share
//! difficulty it cleared. The estimator is advanced lazily: whenever a
//! sample or a query comes in, the ring is rolled forward to the current
//! second, clearing the seconds that were skipped.

use std::time::Duration;

/// Ring size: five minutes of one-second buckets.
pub const GH_BUCKETS: usize = 60 * 5;

/// A time jump this large without nonces drops the whole history; the miner
/// was not running, so the window contents no longer mean anything.
pub const GH_LIMIT_SECS: u64 = 10;

/// Minimum nonces for a rate to be reported. The first nonce only anchors
/// the interval, so one more than this must arrive.
pub const GH_NONCES_NEEDED: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Total difficulty of the nonces in this second.
    diff: i64,
    /// Arrival of the first nonce in this second.
    first_t: Option<Duration>,
    /// Difficulty of that first nonce.
    first_d: i64,
    /// Arrival of the last nonce in this second.
    last_t: Option<Duration>,
    nonces: u32,
}

/// Five-minute rolling diff window.
///
/// Single-producer (the receiver loop) and advanced lazily; queries from
/// the API or the tuner share the same lock the producer holds.
#[derive(Debug)]
pub struct HashRateBuckets {
    /// Second corresponding to `buckets[offset]`.
    zerosec: u64,
    offset: usize,
    buckets: Box<[Bucket; GH_BUCKETS]>,
    /// Buckets in use since the last reset, capped at the ring size.
    used: usize,
    started: bool,
}

impl Default for HashRateBuckets {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRateBuckets {
    pub fn new() -> Self {
        Self {
            zerosec: 0,
            offset: 0,
            buckets: Box::new([Bucket::default(); GH_BUCKETS]),
            used: 0,
            started: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one nonce of difficulty `diff` at monotonic time `now`
    /// (measured from device start).
    pub fn add_nonce(&mut self, now: Duration, diff: u64) {
        let sec = now.as_secs();
        self.roll_to(sec);

        let bucket = &mut self.buckets[self.offset];
        bucket.diff += diff as i64;
        bucket.nonces += 1;
        bucket.last_t = Some(now);
        if bucket.first_t.is_none() {
            bucket.first_t = Some(now);
            bucket.first_d = diff as i64;
        }
    }

    /// Advance the ring to `sec`, clearing skipped seconds. A gap beyond
    /// [`GH_LIMIT_SECS`] resets the history.
    fn roll_to(&mut self, sec: u64) {
        if !self.started {
            self.started = true;
            self.zerosec = sec;
            return;
        }
        if sec == self.zerosec {
            return;
        }
        if sec < self.zerosec || sec - self.zerosec > GH_LIMIT_SECS {
            self.reset();
            self.started = true;
            self.zerosec = sec;
            return;
        }

        for _ in 0..(sec - self.zerosec) {
            self.offset = (self.offset + 1) % GH_BUCKETS;
            self.buckets[self.offset] = Bucket::default();
            self.used = (self.used + 1).min(GH_BUCKETS - 1);
        }
        self.zerosec = sec;
    }

    /// Estimated hash rate in H/s over the last `window` seconds, or `None`
    /// when too few nonces arrived to say anything.
    ///
    /// The rate is `Σdiff × 2³² / (last − first)` with the first nonce's
    /// difficulty excluded: that nonce opens the measurement interval but
    /// its own work happened before it.
    pub fn rate(&mut self, now: Duration, window: u64) -> Option<f64> {
        self.roll_to(now.as_secs());

        let span = (window as usize).min(self.used + 1);
        let mut diff_sum = 0i64;
        let mut nonces = 0usize;
        let mut first: Option<(Duration, i64)> = None;
        let mut last: Option<Duration> = None;

        for back in 0..span {
            let idx = (self.offset + GH_BUCKETS - back) % GH_BUCKETS;
            let b = &self.buckets[idx];
            if b.nonces == 0 {
                continue;
            }
            diff_sum += b.diff;
            nonces += b.nonces as usize;
            if let Some(t) = b.first_t {
                first = Some((t, b.first_d));
            }
            if last.is_none() {
                last = b.last_t;
            }
        }

        let (first_t, first_d) = first?;
        let last_t = last?;
        if nonces < GH_NONCES_NEEDED + 1 || last_t <= first_t {
            return None;
        }

        let interval = (last_t - first_t).as_secs_f64();
        Some((diff_sum - first_d) as f64 * 4_294_967_296.0 / interval)
    }

    /// Nonces currently held across the whole window.
    pub fn nonce_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nonces as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64, millis: u64) -> Duration {
        Duration::from_secs(secs) + Duration::from_millis(millis)
    }

    #[test]
    fn too_few_nonces_yield_no_rate() {
        let mut gh = HashRateBuckets::new();
        for i in 0..GH_NONCES_NEEDED {
            gh.add_nonce(at(i as u64, 0), 64);
        }
        assert_eq!(gh.rate(at(GH_NONCES_NEEDED as u64, 0), 300), None);
    }

    #[test]
    fn steady_stream_estimates_rate() {
        let mut gh = HashRateBuckets::new();
        // one diff-64 nonce per second for 20 seconds
        for i in 0..20 {
            gh.add_nonce(at(i, 0), 64);
        }
        let rate = gh.rate(at(19, 500), 300).expect("enough nonces");
        // 19 intervals carrying 19*64 diff over 19 s => 64 * 2^32 H/s
        let expected = 64.0 * 4_294_967_296.0;
        assert!(
            (rate - expected).abs() / expected < 1e-9,
            "rate {rate} vs {expected}"
        );
    }

    #[test]
    fn gap_beyond_limit_drops_history() {
        let mut gh = HashRateBuckets::new();
        for i in 0..20 {
            gh.add_nonce(at(i, 0), 64);
        }
        // an 11-second silence means the miner was down
        gh.add_nonce(at(31, 0), 64);
        assert_eq!(gh.nonce_count(), 1);
        assert_eq!(gh.rate(at(31, 0), 300), None);
    }

    #[test]
    fn small_gap_keeps_history() {
        let mut gh = HashRateBuckets::new();
        for i in 0..15 {
            gh.add_nonce(at(i, 0), 64);
        }
        // exactly at the limit: still within the window
        gh.add_nonce(at(14 + GH_LIMIT_SECS, 0), 64);
        assert_eq!(gh.nonce_count(), 16);
    }

    #[test]
    fn window_excludes_older_buckets() {
        let mut gh = HashRateBuckets::new();
        for i in 0..40 {
            gh.add_nonce(at(i, 0), 64);
        }
        // a 10-second window sees only the most recent seconds
        let narrow = gh.rate(at(39, 900), 10).expect("rate");
        let wide = gh.rate(at(39, 900), 300).expect("rate");
        let expected = 64.0 * 4_294_967_296.0;
        assert!((narrow - expected).abs() / expected < 1e-9);
        assert!((wide - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn old_seconds_fall_off_the_ring() {
        let mut gh = HashRateBuckets::new();
        gh.add_nonce(at(0, 0), 1000);
        // keep the ring alive past a full wrap
        let mut t = 0;
        while t < (GH_BUCKETS as u64) + 10 {
            t += GH_LIMIT_SECS;
            gh.add_nonce(at(t, 0), 64);
        }
        // the original diff-1000 bucket has been overwritten; only the
        // nonces inside the five-minute ring remain
        let total: i64 = gh.buckets.iter().map(|b| b.diff).sum();
        assert_eq!(total, 64 * 30);
        assert!(gh.nonce_count() <= GH_BUCKETS);
    }
}
