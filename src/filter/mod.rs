//! Noise cancellation signal chain.
//!
//! The chain removes the slow DC drift of each input with a
//! [`LeakyIntegrator`] and then cancels the noise that the optical channel
//! shares with the reference channel with an [`AdaptiveFilter`]. The filters
//! are generic over the [`Sample`] type, so the same algorithm runs in single
//! or double precision, or on any fixed-point type implementing the required
//! arithmetic.

use num_traits::Num;

mod canceller;
mod leaky;
mod nlms;

pub use canceller::{CancelledSample, NoiseCanceller};
pub use leaky::LeakyIntegrator;
pub use nlms::{AdaptiveFilter, FilterOutput, NlmsParameters, StepMode};

/// Numeric type processed by the filters.
///
/// [`Num`] provides the arithmetic and the zero test. Types that have no
/// not-a-number representation return `false` from [`Sample::is_nan`].
pub trait Sample: Num + Copy + PartialOrd + std::fmt::Debug {
    /// Returns `true` if the value is not a number.
    fn is_nan(self) -> bool;
}

impl Sample for f32 {
    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }
}

impl Sample for f64 {
    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }
}
