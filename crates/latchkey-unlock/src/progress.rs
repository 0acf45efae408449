//! Progress reporting for one unlock attempt.

/// Share of the bar taken by key derivation.
pub const KDF_END: f32 = 0.7;

/// Bar position once the payload is decrypted and verified.
pub const DECRYPT_END: f32 = 0.8;

/// Clamps fractions to `[0, 1]` and drops anything that would move the bar
/// backwards. One reporter per attempt.
pub struct ProgressReporter<'a> {
    sink: &'a mut dyn FnMut(f32),
    last: Option<f32>,
}

impl<'a> ProgressReporter<'a> {
    /// Forward accepted fractions to `sink`.
    pub fn new(sink: &'a mut dyn FnMut(f32)) -> Self {
        Self { sink, last: None }
    }

    /// Report an overall fraction.
    pub fn report(&mut self, fraction: f32) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        match self.last {
            Some(last) if fraction <= last => {}
            _ => {
                self.last = Some(fraction);
                (self.sink)(fraction);
            }
        }
    }

    /// Report `fraction` of the phase spanning `[start, end]`.
    pub fn report_in(&mut self, start: f32, end: f32, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.report((end - start).mul_add(fraction, start));
    }

    /// Last accepted fraction.
    #[must_use]
    pub fn fraction(&self) -> f32 {
        self.last.unwrap_or(0.0)
    }
}
