//! Streaming estimation of latency quantiles.
//!
//! [ExtendedPSquare] implements the extended P² algorithm (Raatikainen), which tracks several
//! quantiles with `2m + 3` markers for `m` target probabilities. Every observation moves the
//! markers in O(m) time and no sample is kept, so memory use does not grow with the length of a
//! run. The estimates converge to the true quantiles as samples accumulate but are not exact.

/// Target probabilities reported for every job.
pub const DEFAULT_QUANTILES: [f64; 4] = [0.5, 0.95, 0.99, 0.999];

#[derive(Debug, Clone)]
pub struct ExtendedPSquare {
    probabilities: Vec<f64>,
    /// The probability each marker tracks: 0, then midpoints and targets alternating, then 1.
    increments: Vec<f64>,
    desired: Vec<f64>,
    positions: Vec<f64>,
    heights: Vec<f64>,
}

impl ExtendedPSquare {
    /// Probabilities outside of `(0, 1)` are ignored.
    pub fn new(probabilities: &[f64]) -> Self {
        let mut probabilities = probabilities
            .iter()
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0 && *p < 1.0)
            .collect::<Vec<_>>();
        probabilities.sort_by(f64::total_cmp);
        probabilities.dedup();

        let targets = probabilities.len();
        let markers = 2 * targets + 3;

        let mut increments = vec![0.0; markers];
        increments[markers - 1] = 1.0;
        for (i, p) in probabilities.iter().enumerate() {
            increments[2 * i + 2] = *p;
        }
        for i in 0..=targets {
            increments[2 * i + 1] = 0.5 * (increments[2 * i] + increments[2 * i + 2]);
        }

        let desired = increments
            .iter()
            .map(|increment| 1.0 + 2.0 * (targets as f64 + 1.0) * increment)
            .collect();

        Self {
            probabilities,
            increments,
            desired,
            positions: (1..=markers).map(|n| n as f64).collect(),
            heights: Vec::with_capacity(markers),
        }
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    fn markers(&self) -> usize {
        self.increments.len()
    }

    pub fn observe(&mut self, value: f64) {
        let markers = self.markers();

        // Fill the markers with the first samples, then start adjusting them.
        if self.heights.len() < markers {
            self.heights.push(value);
            if self.heights.len() == markers {
                self.heights.sort_by(f64::total_cmp);
            }
            return;
        }

        let last = markers - 1;
        let cell = if value < self.heights[0] {
            self.heights[0] = value;
            1
        } else if value >= self.heights[last] {
            self.heights[last] = value;
            last
        } else {
            self.heights.partition_point(|height| *height <= value)
        };

        for position in &mut self.positions[cell..] {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(&self.increments) {
            *desired += increment;
        }

        for i in 1..last {
            self.adjust_marker(i);
        }
    }

    fn adjust_marker(&mut self, i: usize) {
        let positions = &mut self.positions;
        let heights = &mut self.heights;

        let d = self.desired[i] - positions[i];
        let dp = positions[i + 1] - positions[i];
        let dm = positions[i - 1] - positions[i];

        if (d >= 1.0 && dp > 1.0) || (d <= -1.0 && dm < -1.0) {
            let sign = d.signum();
            let hp = (heights[i + 1] - heights[i]) / dp;
            let hm = (heights[i - 1] - heights[i]) / dm;

            let parabolic =
                heights[i] + sign / (dp - dm) * ((sign - dm) * hp + (dp - sign) * hm);
            if heights[i - 1] < parabolic && parabolic < heights[i + 1] {
                heights[i] = parabolic;
            } else if sign > 0.0 {
                heights[i] += hp;
            } else {
                heights[i] -= hm;
            }

            positions[i] += sign;
        }
    }

    /// The current estimate for probability `p`, or `None` before the first observation.
    ///
    /// Tracked probabilities return their marker directly. Other probabilities are interpolated
    /// linearly between the neighbouring markers.
    pub fn quantile(&self, p: f64) -> Option<f64> {
        if self.heights.is_empty() || p.is_nan() {
            return None;
        }
        let p = p.clamp(0.0, 1.0);

        if self.heights.len() < self.markers() {
            return Some(warm_up_quantile(&self.heights, p));
        }

        let upper = self.increments.partition_point(|increment| *increment < p);
        if upper == 0 {
            return Some(self.heights[0]);
        }
        if upper >= self.markers() {
            return self.heights.last().copied();
        }
        if self.increments[upper] == p {
            return Some(self.heights[upper]);
        }

        let lower = upper - 1;
        let weight =
            (p - self.increments[lower]) / (self.increments[upper] - self.increments[lower]);
        Some(self.heights[lower] + weight * (self.heights[upper] - self.heights[lower]))
    }
}

/// Linear interpolation between the closest ranks of the few samples seen so far.
fn warm_up_quantile(samples: &[f64], p: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    sorted[lower] + (rank - lower as f64) * (sorted[upper] - sorted[lower])
}

/// Running mean, max and quantile estimates over a stream of samples.
///
/// Nothing is ever reset; an accumulator describes everything it has observed since it was
/// created.
#[derive(Debug, Clone)]
pub struct QuantileAccumulator {
    count: u64,
    sum: f64,
    max: Option<f64>,
    quantiles: ExtendedPSquare,
}

impl Default for QuantileAccumulator {
    fn default() -> Self {
        Self::new(&DEFAULT_QUANTILES)
    }
}

impl QuantileAccumulator {
    pub fn new(probabilities: &[f64]) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            max: None,
            quantiles: ExtendedPSquare::new(probabilities),
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
        self.quantiles.observe(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn quantile(&self, p: f64) -> Option<f64> {
        self.quantiles.quantile(p)
    }

    pub fn probabilities(&self) -> &[f64] {
        self.quantiles.probabilities()
    }
}
