use super::Sample;

/// Leaky integrator.
///
/// A single-pole exponential average, used to track the DC level of a signal:
/// `y[n] = alpha * y[n-1] + complement * x[n]`. The complement is normally
/// `1 - alpha`, but it is given separately so that a fixed-point
/// representation can round the two weights independently.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakyIntegrator<T> {
    alpha: T,
    complement: T,
    last: T,
}

impl<T: Sample> LeakyIntegrator<T> {
    /// Creates a leaky integrator with explicit weights and initial output.
    pub fn new(alpha: T, complement: T, initial: T) -> LeakyIntegrator<T> {
        LeakyIntegrator {
            alpha,
            complement,
            last: initial,
        }
    }

    /// Creates a leaky integrator whose complementary weight is `1 - alpha`.
    pub fn with_alpha(alpha: T, initial: T) -> LeakyIntegrator<T> {
        LeakyIntegrator::new(alpha, T::one() - alpha, initial)
    }

    /// Feeds a sample and returns the new output.
    pub fn step(&mut self, sample: T) -> T {
        self.last = self.alpha * self.last + self.complement * sample;
        self.last
    }

    /// Returns the last output.
    pub fn last(&self) -> T {
        self.last
    }
}
