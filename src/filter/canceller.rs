use super::{AdaptiveFilter, LeakyIntegrator, NlmsParameters, Sample};

/// Result of cancelling one pair of samples.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CancelledSample<T> {
    /// Optical sample with its DC level removed.
    pub optical: T,
    /// Reference sample with its DC level removed.
    pub reference: T,
    /// Estimation error of the adaptive filter.
    pub error: T,
    /// Step size of the adaptive filter after this sample.
    pub step_size: T,
    /// Optical signal minus the estimation error.
    pub cancelled: T,
}

/// Adaptive noise canceller.
///
/// Each input first goes through its own DC-removing leaky integrator. The
/// adaptive filter is then fed the optical signal as its input and the
/// reference as its desired signal, so the filter history holds optical
/// samples and the error is `reference - h . optical`.
#[derive(Debug, Clone)]
pub struct NoiseCanceller<T> {
    optical_dc: LeakyIntegrator<T>,
    reference_dc: LeakyIntegrator<T>,
    filter: AdaptiveFilter<T>,
}

impl<T: Sample> NoiseCanceller<T> {
    /// Creates a noise canceller.
    ///
    /// `dc` is the leaky integrator used as a template for both inputs.
    pub fn new(
        taps: usize,
        params: NlmsParameters<T>,
        dc: LeakyIntegrator<T>,
    ) -> NoiseCanceller<T> {
        NoiseCanceller {
            optical_dc: dc.clone(),
            reference_dc: dc,
            filter: AdaptiveFilter::new(taps, params),
        }
    }

    /// Processes one `(optical, reference)` pair.
    pub fn process(&mut self, optical: T, reference: T) -> CancelledSample<T> {
        let optical = optical - self.optical_dc.step(optical);
        let reference = reference - self.reference_dc.step(reference);
        let out = self.filter.step(optical, reference);
        CancelledSample {
            optical,
            reference,
            error: out.error,
            step_size: out.step_size,
            cancelled: optical - out.error,
        }
    }

    /// The adaptive filter.
    pub fn filter(&self) -> &AdaptiveFilter<T> {
        &self.filter
    }

    /// Restores the initial step size of the adaptive filter.
    pub fn reset_step_size(&mut self) {
        self.filter.reset_step_size();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::StepMode;

    fn canceller() -> NoiseCanceller<f64> {
        let params = NlmsParameters {
            initial_step: 1e-6,
            min_step: 1e-7,
            max_step: 1e-5,
            epsilon: 1e-6,
            mode: StepMode::Variable {
                alpha: 0.5,
                gamma: 0.5,
            },
            normalized: true,
        };
        NoiseCanceller::new(1, params, LeakyIntegrator::new(0.99, 0.01, 0.0))
    }

    #[test]
    fn identical_inputs_error_never_grows() {
        let mut anc = canceller();
        let mut last = f64::INFINITY;
        for _ in 0..500 {
            let out = anc.process(1000.0, 1000.0);
            assert_eq!(out.optical, out.reference);
            assert!(out.error.abs() <= last, "{} > {last}", out.error.abs());
            assert!((1e-7..=1e-5).contains(&out.step_size));
            last = out.error.abs();
        }
    }

    #[test]
    fn cancelled_is_optical_minus_error() {
        let mut anc = canceller();
        for n in 0..100 {
            let ramp = n as f64;
            let out = anc.process(3.0 * ramp + 7.0, ramp);
            approx::assert_abs_diff_eq!(out.cancelled + out.error, out.optical, epsilon = 1e-9);
        }
    }

    #[test]
    fn optical_is_the_filter_input() {
        let params = NlmsParameters {
            initial_step: 0.5,
            min_step: 0.5,
            max_step: 0.5,
            epsilon: 0.0,
            mode: StepMode::Fixed,
            normalized: false,
        };
        // no DC tracking, so the filter sees the raw samples
        let mut anc = NoiseCanceller::new(1, params, LeakyIntegrator::new(0.0, 0.0, 0.0));
        let first = anc.process(2.0, 3.0);
        // zero taps: the error is the whole reference
        assert_eq!(first.error, 3.0);
        assert_eq!(first.cancelled, -1.0);
        assert_eq!(anc.filter().history(), &[2.0]);
        // h = 0.5 * 3 * 2 = 3, so the error is 1 - 3 * 4
        assert_eq!(anc.filter().taps(), &[3.0]);
        let second = anc.process(4.0, 1.0);
        assert_eq!(second.error, -11.0);
        assert_eq!(second.cancelled, 15.0);
    }

    #[test]
    fn dc_is_removed_before_filtering() {
        let mut anc = canceller();
        let out = anc.process(100.0, 50.0);
        approx::assert_abs_diff_eq!(out.optical, 99.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(out.reference, 49.5, epsilon = 1e-12);
        // optical history enters the filter
        assert_eq!(anc.filter().history(), &[out.optical]);
    }
}
