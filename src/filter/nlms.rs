use super::Sample;

/// Step size adaptation strategy.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum StepMode<T> {
    /// The step size stays at its initial value.
    Fixed,
    /// The step size follows `mu = alpha * mu + gamma * e * x[0]`.
    Variable {
        /// Forgetting factor of the step size.
        alpha: T,
        /// Gain of the error correlation term.
        gamma: T,
    },
}

/// Parameters of an [`AdaptiveFilter`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NlmsParameters<T> {
    /// Step size at creation and after [`AdaptiveFilter::reset_step_size`].
    pub initial_step: T,
    /// Lower bound of the step size.
    pub min_step: T,
    /// Upper bound of the step size.
    pub max_step: T,
    /// Regularization added to the input power.
    pub epsilon: T,
    /// Step size adaptation.
    pub mode: StepMode<T>,
    /// Divide the tap updates by the input power.
    pub normalized: bool,
}

/// Output of a single [`AdaptiveFilter::step`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FilterOutput<T> {
    /// Desired sample minus the filter estimate.
    pub error: T,
    /// Step size after the update.
    pub step_size: T,
}

/// Normalized LMS adaptive filter with variable step size (NLMS-VSS).
///
/// The filter estimates the desired signal `d` from the last `taps` samples of
/// the input `x`, and adapts its weights to minimize the error. The number of
/// taps is fixed when the filter is created; the tap and history vectors are
/// never reallocated.
#[derive(Debug, Clone)]
pub struct AdaptiveFilter<T> {
    h: Box<[T]>,
    x: Box<[T]>,
    step_size: T,
    params: NlmsParameters<T>,
}

fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

impl<T: Sample> AdaptiveFilter<T> {
    /// Creates a filter with `taps` taps, all weights set to zero.
    ///
    /// # Panics
    ///
    /// Panics if `taps` is zero or if `min_step > max_step`.
    pub fn new(taps: usize, params: NlmsParameters<T>) -> AdaptiveFilter<T> {
        assert!(taps >= 1, "an adaptive filter needs at least one tap");
        assert!(
            params.min_step <= params.max_step,
            "invalid step size bounds"
        );
        let step_size = clamp(params.initial_step, params.min_step, params.max_step);
        AdaptiveFilter {
            h: vec![T::zero(); taps].into_boxed_slice(),
            x: vec![T::zero(); taps].into_boxed_slice(),
            step_size,
            params,
        }
    }

    /// Number of taps.
    pub fn len(&self) -> usize {
        self.h.len()
    }

    /// Returns `false`; a filter always has at least one tap.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Current tap weights.
    pub fn taps(&self) -> &[T] {
        &self.h
    }

    /// Input history, newest sample first.
    pub fn history(&self) -> &[T] {
        &self.x
    }

    /// Current step size.
    pub fn step_size(&self) -> T {
        self.step_size
    }

    /// Filters one sample pair and adapts the filter.
    ///
    /// `x_next` is the next input sample and `d_next` the next
    /// desired sample. Tap updates are divided by `epsilon + |x|^2` in
    /// normalized mode, unless that power is zero. A tap update that is not a
    /// number is skipped.
    pub fn step(&mut self, x_next: T, d_next: T) -> FilterOutput<T> {
        let taps = self.x.len();
        self.x.copy_within(0..taps - 1, 1);
        self.x[0] = x_next;

        let (estimate, energy) = self
            .h
            .iter()
            .zip(self.x.iter())
            .fold((T::zero(), T::zero()), |(estimate, energy), (&h, &x)| {
                (estimate + h * x, energy + x * x)
            });
        let power = self.params.epsilon + energy;
        let error = d_next - estimate;

        let normalize = self.params.normalized && !power.is_zero();
        for (h, &x) in self.h.iter_mut().zip(self.x.iter()) {
            let mut delta = self.step_size * error * x;
            if normalize {
                delta = delta / power;
            }
            if delta.is_nan() {
                delta = T::zero();
            }
            *h = *h + delta;
        }

        if let StepMode::Variable { alpha, gamma } = self.params.mode {
            let step_size = alpha * self.step_size + gamma * error * self.x[0];
            if !step_size.is_nan() {
                self.step_size = step_size;
            }
        }
        self.step_size = clamp(self.step_size, self.params.min_step, self.params.max_step);

        FilterOutput {
            error,
            step_size: self.step_size,
        }
    }

    /// Restores the initial step size. Taps and history are kept.
    pub fn reset_step_size(&mut self) {
        self.step_size = clamp(
            self.params.initial_step,
            self.params.min_step,
            self.params.max_step,
        );
    }

    /// Sets all the tap weights to `value`.
    pub fn reset_taps(&mut self, value: T) {
        self.h.fill(value);
    }

    /// Zeroes the input history.
    pub fn clear_history(&mut self) {
        self.x.fill(T::zero());
    }
}
