//! Smoothed gain stage for the audible branch
//!
//! Gain approaches its target along a first-order exponential with a 20ms
//! time constant, so mute and volume changes do not click.

/// Time constant of the gain ramp in seconds
pub const GAIN_TIME_CONSTANT: f32 = 0.02;

/// Per-sample exponential gain smoother
#[derive(Debug, Clone)]
pub struct GainStage {
    current: f32,
    target: f32,
    sample_rate: u32,
    coeff: f32,
}

impl GainStage {
    /// Create a stage that starts settled at `initial`
    pub fn new(initial: f32, sample_rate: u32) -> Self {
        let initial = sanitize(initial);
        let mut stage = Self {
            current: initial,
            target: initial,
            sample_rate: 0,
            coeff: 1.0,
        };
        stage.set_sample_rate(sample_rate);
        stage
    }

    /// Recompute the smoothing coefficient for a new sample rate
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate || sample_rate == 0 {
            return;
        }
        self.sample_rate = sample_rate;
        self.coeff = 1.0 - (-1.0 / (GAIN_TIME_CONSTANT * sample_rate as f32)).exp();
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = sanitize(target);
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    /// Apply the ramp in place to interleaved samples
    ///
    /// The gain advances once per frame, identically on every channel.
    pub fn apply(&mut self, samples: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in samples.chunks_mut(channels) {
            self.current += (self.target - self.current) * self.coeff;
            if (self.current - self.target).abs() < 1e-6 {
                self.current = self.target;
            }
            for sample in frame.iter_mut() {
                *sample *= self.current;
            }
        }
    }
}

fn sanitize(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_settled_gain_is_exact() {
        let mut stage = GainStage::new(0.5, 48000);
        let mut samples = vec![1.0f32; 8];
        stage.apply(&mut samples, 2);
        assert!(samples.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_ramp_reaches_63_percent_after_one_time_constant() {
        let sample_rate = 48000;
        let mut stage = GainStage::new(0.0, sample_rate);
        stage.set_target(1.0);

        // 20ms of mono samples
        let frames = (GAIN_TIME_CONSTANT * sample_rate as f32) as usize;
        let mut samples = vec![1.0f32; frames];
        stage.apply(&mut samples, 1);

        assert_relative_eq!(stage.current(), 1.0 - (-1.0f32).exp(), epsilon = 0.01);
        // No instantaneous jump
        assert!(samples[0] < 0.01);
    }

    #[test]
    fn test_ramp_converges_to_zero() {
        let mut stage = GainStage::new(1.0, 48000);
        stage.set_target(0.0);
        let mut samples = vec![1.0f32; 48000];
        stage.apply(&mut samples, 1);
        assert_eq!(stage.current(), 0.0);
        assert_eq!(*samples.last().unwrap(), 0.0);
    }

    #[test]
    fn test_target_clamped() {
        let mut stage = GainStage::new(2.0, 48000);
        assert_eq!(stage.current(), 1.0);
        stage.set_target(-3.0);
        assert_eq!(stage.target(), 0.0);
        stage.set_target(f32::NAN);
        assert_eq!(stage.target(), 0.0);
    }

    #[test]
    fn test_channels_share_gain_per_frame() {
        let mut stage = GainStage::new(0.0, 48000);
        stage.set_target(1.0);
        let mut samples = vec![1.0f32; 20];
        stage.apply(&mut samples, 2);
        for frame in samples.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }
}
