use std::fmt::Debug;

/// Decides once per trace, at the root, whether spans are exported.
pub trait Sampler: Send + Sync + Debug {
    fn should_sample(&self, trace_id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSample;

impl Sampler for AlwaysSample {
    fn should_sample(&self, _trace_id: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSample;

impl Sampler for NeverSample {
    fn should_sample(&self, _trace_id: &str) -> bool {
        false
    }
}

/// Samples by comparing the first trace id byte against `rate`.
#[derive(Debug, Clone, Copy)]
pub struct ProbabilitySampler {
    rate: f64,
}

impl ProbabilitySampler {
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Sampler for ProbabilitySampler {
    fn should_sample(&self, trace_id: &str) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        match trace_id.get(..2).and_then(|b| u8::from_str_radix(b, 16).ok()) {
            Some(first) => f64::from(first) / 255.0 < self.rate,
            None => true,
        }
    }
}
