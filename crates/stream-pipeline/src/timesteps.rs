use serde::Serialize;
use tracing::warn;

use crate::PipelineError;

/// Length of the scheduler's full timestep schedule.
pub const DEFAULT_TOTAL_STEPS: u32 = 50;

/// Default number of denoising steps used for turbo models.
pub const DEFAULT_TURBO_STEPS: u32 = 2;

/// Sampling settings the timestep index list is derived from.
///
/// A request is fixed for the lifetime of an engine; changing it means building a new one.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SamplingRequest {
    steps: u32,
    denoise: f32,
    total_steps: u32,
}

impl SamplingRequest {
    /// Creates a request against the default 50-step schedule.
    pub fn new(steps: u32, denoise: f32) -> Result<Self, PipelineError> {
        Self::with_total_steps(steps, denoise, DEFAULT_TOTAL_STEPS)
    }

    /// Creates a request, clamping `denoise` into `[0, 1]` and `steps` to at least 1.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidParameter` if `denoise` is not finite or
    /// `total_steps` is zero.
    pub fn with_total_steps(
        steps: u32,
        denoise: f32,
        total_steps: u32,
    ) -> Result<Self, PipelineError> {
        if !denoise.is_finite() {
            return Err(PipelineError::InvalidParameter(format!(
                "denoise must be a finite number, got {denoise}"
            )));
        }
        if total_steps == 0 {
            return Err(PipelineError::InvalidParameter(
                "total_steps must be at least 1".to_string(),
            ));
        }
        let clamped = denoise.clamp(0.0, 1.0);
        if clamped != denoise {
            warn!(denoise, clamped, "Denoise strength clamped into [0, 1]");
        }
        if steps == 0 {
            warn!("Step count of 0 raised to 1");
        }
        Ok(Self {
            steps: steps.max(1),
            denoise: clamped,
            total_steps,
        })
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn denoise(&self) -> f32 {
        self.denoise
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    /// The schedule position denoising starts from.
    pub fn start_index(&self) -> u32 {
        let total = f64::from(self.total_steps);
        (total * f64::from(self.denoise))
            .round()
            .clamp(0.0, total - 1.0) as u32
    }

    /// Selects the timestep indices for this request.
    pub fn indices(&self) -> TimestepIndexList {
        let start = self.start_index();
        if self.steps == 1 {
            return TimestepIndexList(vec![start]);
        }
        // At most one step per position: every position from start down to 0 is taken.
        if self.steps > start {
            return TimestepIndexList((0..=start).rev().collect());
        }

        let steps = self.steps as usize;
        let step_size = f64::from(start) / (steps - 1) as f64;
        let mut indices: Vec<u32> = (0..steps)
            .map(|i| (f64::from(start) - i as f64 * step_size).trunc().max(0.0) as u32)
            .chain([start, 0])
            .collect();
        sort_descending(&mut indices);

        if indices.len() > steps {
            let max = indices[0];
            let min = indices[indices.len() - 1];
            let step = f64::from(max - min) / (steps - 1) as f64;
            let mut resampled = Vec::with_capacity(steps);
            resampled.push(max);
            resampled.extend(
                (1..steps - 1).map(|i| (f64::from(max) - i as f64 * step).trunc() as u32),
            );
            resampled.push(min);
            sort_descending(&mut resampled);
            indices = resampled;
        }

        TimestepIndexList(indices)
    }
}

fn sort_descending(indices: &mut Vec<u32>) {
    indices.sort_unstable_by(|a, b| b.cmp(a));
    indices.dedup();
}

/// Computes the timestep index list for `steps` denoising steps at strength `denoise`.
///
/// Shorthand for [`SamplingRequest::with_total_steps`] followed by [`SamplingRequest::indices`].
pub fn compute_indices(
    steps: u32,
    denoise: f32,
    total_steps: u32,
) -> Result<TimestepIndexList, PipelineError> {
    Ok(SamplingRequest::with_total_steps(steps, denoise, total_steps)?.indices())
}

/// Strictly descending schedule positions, always ending at 0.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct TimestepIndexList(Vec<u32>);

impl TimestepIndexList {
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u32> {
        self.0
    }
}

impl std::ops::Deref for TimestepIndexList {
    type Target = [u32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Returns true if `model` names a single-step distilled ("turbo") model.
pub fn is_turbo_model(model: &str) -> bool {
    model.to_lowercase().contains("turbo")
}

/// How the timestep indices of an engine are chosen.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TimestepStrategy {
    /// Derived from the step count and denoising strength.
    Formula(SamplingRequest),
    /// Fixed positions tuned for turbo models, selected by the configured turbo step count.
    FixedTurboTable { turbo_steps: u32 },
}

impl TimestepStrategy {
    /// Chooses the strategy for `model`.
    pub fn for_model(model: &str, sampling: SamplingRequest, turbo_steps: u32) -> Self {
        if is_turbo_model(model) {
            Self::FixedTurboTable { turbo_steps }
        } else {
            Self::Formula(sampling)
        }
    }

    pub fn is_turbo(&self) -> bool {
        matches!(self, Self::FixedTurboTable { .. })
    }

    /// The index list handed to the engine.
    ///
    /// Turbo tables are listed in ascending order, the formula in descending order.
    pub fn t_index_list(&self) -> Vec<u32> {
        match self {
            Self::Formula(sampling) => sampling.indices().into_inner(),
            Self::FixedTurboTable { turbo_steps: 1 } => vec![45],
            Self::FixedTurboTable { .. } => vec![35, 45],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_indices_reference_values() {
        assert_eq!(compute_indices(4, 0.6, 50).unwrap().as_slice(), &[30, 20, 10, 0]);
        assert_eq!(compute_indices(1, 0.6, 50).unwrap().as_slice(), &[30]);
        assert_eq!(compute_indices(4, 0.0, 50).unwrap().as_slice(), &[0]);
    }

    #[test]
    fn test_compute_indices_uneven_spacing() {
        // start 25, step 25 / 3
        assert_eq!(compute_indices(4, 0.5, 50).unwrap().as_slice(), &[25, 16, 8, 0]);
        assert_eq!(compute_indices(2, 1.0, 50).unwrap().as_slice(), &[49, 0]);
    }

    #[test]
    fn test_more_steps_than_positions() {
        // start 2 leaves only three distinct positions
        assert_eq!(compute_indices(8, 0.04, 50).unwrap().as_slice(), &[2, 1, 0]);
        assert_eq!(compute_indices(4, 0.06, 50).unwrap().as_slice(), &[3, 2, 1, 0]);
    }

    #[test]
    fn test_huge_step_count() {
        let indices = compute_indices(u32::MAX, 0.1, 50).unwrap();
        assert_eq!(indices.as_slice(), &[5, 4, 3, 2, 1, 0]);

        let indices = compute_indices(u32::MAX, 1.0, 1000).unwrap();
        assert_eq!(indices.len(), 1000);
        assert_eq!(indices.first(), Some(&999));
        assert_eq!(indices.last(), Some(&0));
    }

    #[test]
    fn test_denoise_is_clamped() {
        assert_eq!(compute_indices(3, 1.7, 50).unwrap().as_slice(), &[49, 24, 0]);
        assert_eq!(compute_indices(3, -0.5, 50).unwrap().as_slice(), &[0]);
    }

    #[test]
    fn test_zero_steps_raised_to_one() {
        let request = SamplingRequest::new(0, 0.6).unwrap();
        assert_eq!(request.steps(), 1);
        assert_eq!(request.indices().as_slice(), &[30]);
    }

    #[test]
    fn test_invalid_requests() {
        assert!(matches!(
            SamplingRequest::new(4, f32::NAN),
            Err(PipelineError::InvalidParameter(_))
        ));
        assert!(matches!(
            compute_indices(4, 0.5, 0),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_index_list_invariants() {
        for total_steps in [1, 7, 50, 1000] {
            for steps in 1..=16 {
                for percent in 0..=100 {
                    let denoise = percent as f32 / 100.0;
                    let request =
                        SamplingRequest::with_total_steps(steps, denoise, total_steps).unwrap();
                    let indices = request.indices();
                    let start = request.start_index();

                    assert!(!indices.is_empty());
                    assert!(indices.len() <= steps as usize, "{indices:?} for {steps} steps");
                    assert!(indices.windows(2).all(|w| w[0] > w[1]), "{indices:?}");
                    assert!(indices.iter().all(|&i| i < total_steps));
                    assert!(indices.contains(&start));
                    if steps > 1 {
                        assert_eq!(indices.last(), Some(&0));
                    }
                }
            }
        }
    }

    #[test]
    fn test_turbo_strategy() {
        let sampling = SamplingRequest::new(4, 0.6).unwrap();

        let strategy = TimestepStrategy::for_model("stabilityai/SD-Turbo", sampling, 2);
        assert!(strategy.is_turbo());
        assert_eq!(strategy.t_index_list(), vec![35, 45]);

        let strategy = TimestepStrategy::for_model("sdxl-turbo", sampling, 1);
        assert_eq!(strategy.t_index_list(), vec![45]);

        let strategy = TimestepStrategy::for_model("models/dreamshaper_8", sampling, 1);
        assert!(!strategy.is_turbo());
        assert_eq!(strategy.t_index_list(), vec![30, 20, 10, 0]);
    }
}
