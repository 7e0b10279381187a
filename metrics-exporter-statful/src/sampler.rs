use std::fmt;

use rand::Rng as _;

const MAX_SAMPLE_RATE: u8 = 100;
const MIN_SAMPLE_RATE: u8 = 1;

/// Percentage of metrics kept by the sampler, between 1 and 100 inclusive.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SampleRate(u8);

impl SampleRate {
    /// Keep every metric.
    pub const ALWAYS: SampleRate = SampleRate(MAX_SAMPLE_RATE);

    /// Creates a new `SampleRate`.
    ///
    /// Returns `None` if `rate` is outside of `[1, 100]`.
    pub const fn new(rate: u8) -> Option<Self> {
        if rate >= MIN_SAMPLE_RATE && rate <= MAX_SAMPLE_RATE {
            Some(SampleRate(rate))
        } else {
            None
        }
    }

    /// Returns the rate as an integer.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Returns `true` if this rate keeps every metric.
    pub const fn is_always(self) -> bool {
        self.0 == MAX_SAMPLE_RATE
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::ALWAYS
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Source of uniformly distributed integers.
#[cfg_attr(test, mockall::automock)]
pub trait RandomSource: Send + Sync {
    /// Returns an integer drawn uniformly from `[0, bound)`.
    fn next_below(&self, bound: u32) -> u32;
}

/// [`RandomSource`] backed by the thread-local generator of `rand`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_below(&self, bound: u32) -> u32 {
        rand::rng().random_range(0..bound)
    }
}

/// Probabilistic admission filter applied before metrics are buffered.
pub struct Sampler {
    rate: SampleRate,
    source: Box<dyn RandomSource>,
}

impl Sampler {
    /// Creates a new `Sampler` drawing from the thread-local generator.
    pub fn new(rate: SampleRate) -> Self {
        Self::with_source(rate, ThreadRandom)
    }

    /// Creates a new `Sampler` drawing from the given source.
    pub fn with_source<R>(rate: SampleRate, source: R) -> Self
    where
        R: RandomSource + 'static,
    {
        Sampler { rate, source: Box::new(source) }
    }

    /// Returns the configured sample rate.
    pub fn rate(&self) -> SampleRate {
        self.rate
    }

    /// Returns `true` if the next metric should be kept.
    ///
    /// A rate of 100 keeps everything without drawing a random number. Any other rate draws from `[0, 100)` and keeps
    /// the metric when the draw is less than or equal to the rate, so the effective keep probability is
    /// `(rate + 1) / 100`.
    pub fn should_keep(&self) -> bool {
        if self.rate.is_always() {
            return true;
        }

        self.source.next_below(u32::from(MAX_SAMPLE_RATE)) <= u32::from(self.rate.get())
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler").field("rate", &self.rate).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::{MockRandomSource, SampleRate, Sampler};

    #[test]
    fn sample_rate_bounds() {
        assert_eq!(SampleRate::new(0), None);
        assert_eq!(SampleRate::new(101), None);
        assert_eq!(SampleRate::new(1).map(SampleRate::get), Some(1));
        assert_eq!(SampleRate::new(100), Some(SampleRate::ALWAYS));
    }

    #[test]
    fn full_rate_never_draws() {
        let mut source = MockRandomSource::new();
        source.expect_next_below().times(0);

        let sampler = Sampler::with_source(SampleRate::ALWAYS, source);
        for _ in 0..1_000 {
            assert!(sampler.should_keep());
        }
    }

    #[test]
    fn partial_rate_boundary_is_inclusive() {
        // Cases are defined as: sample rate, drawn value, expected decision.
        let cases: [(u8, u32, bool); 8] = [
            (50, 49, true),
            (50, 50, true),
            (50, 51, false),
            (1, 0, true),
            (1, 1, true),
            (1, 2, false),
            (99, 98, true),
            (99, 99, true),
        ];

        for (rate, draw, expected) in cases {
            let mut source = MockRandomSource::new();
            source.expect_next_below().with(eq(100)).times(1).return_const(draw);

            let sampler = Sampler::with_source(SampleRate::new(rate).unwrap(), source);
            assert_eq!(sampler.should_keep(), expected, "rate={rate} draw={draw}");
        }
    }

    #[test]
    fn thread_random_stays_in_bounds() {
        let sampler = Sampler::new(SampleRate::new(10).unwrap());
        let kept = (0..10_000).filter(|_| sampler.should_keep()).count();

        // Expected keep probability is 11%.
        assert!(kept > 700 && kept < 1_500, "kept {kept} of 10000");
    }
}
