//! Monte Carlo update machinery: proposal generators for the local
//! moves, the adaptive step-width state used during thermalization, and
//! the global-move bookkeeping.

pub(crate) mod global;
mod local;

pub use local::Changed;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::PI;

use crate::config::SpinProposalMethod;
use crate::fields::Phi;

/// A direction drawn uniformly from {-1,+1}, the unit circle or the
/// unit sphere depending on the number of order-parameter components.
pub fn random_direction<const OPDIM: usize, R: Rng>(rng: &mut R) -> Phi<OPDIM> {
    let mut dir = Phi::<OPDIM>::zeros();
    match OPDIM {
        1 => {
            dir[0] = if rng.gen::<f64>() <= 0.5 { -1.0 } else { 1.0 };
        }
        2 => {
            let angle = rng.gen_range(0.0..2.0 * PI);
            dir[0] = angle.cos();
            dir[1] = angle.sin();
        }
        3 => {
            let z: f64 = rng.gen_range(-1.0..1.0);
            let angle = rng.gen_range(0.0..2.0 * PI);
            let rho = (1.0 - z * z).sqrt();
            dir[0] = rho * angle.cos();
            dir[1] = rho * angle.sin();
            dir[2] = z;
        }
        _ => unreachable!("unsupported number of order-parameter components"),
    }
    dir
}

/// New orientation inside a spherical cone of opening cos(theta) >=
/// `angle_delta` around the old vector, preserving its length.
pub fn rotated_vector<const OPDIM: usize, R: Rng>(
    rng: &mut R,
    angle_delta: f64,
    vec: Phi<OPDIM>,
) -> Phi<OPDIM> {
    assert!(OPDIM == 3, "rotation proposals need three components");
    let (x, y, z) = (vec[0], vec[1], vec[2]);
    let r2 = x * x + y * y + z * z;
    let r = r2.sqrt();

    // cos(theta) in [angle_delta, 1]
    let cos_theta = rng.gen::<f64>() * (1.0 - angle_delta) + angle_delta;
    let azimuth = rng.gen::<f64>() * 2.0 * PI;
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    let (cos_phi, sin_phi) = (azimuth.cos(), azimuth.sin());

    // normalized old spin
    let x2n = x * x / r2;
    let y2n = y * y / r2;
    let xn = x / r;
    let yn = y / r;
    let zn = z / r;

    // cone rotated so its axis aligns with the old spin
    let mut new = Phi::<OPDIM>::zeros();
    new[0] = (sin_theta / (x2n + y2n)) * ((x2n * zn + y2n) * cos_phi + (zn - 1.0) * xn * yn * sin_phi)
        + xn * cos_theta;
    new[1] = (sin_theta / (x2n + y2n)) * ((zn - 1.0) * xn * yn * cos_phi + (x2n + y2n * zn) * sin_phi)
        + yn * cos_theta;
    new[2] = -sin_theta * (xn * cos_phi + yn * sin_phi) + zn * cos_theta;
    new * r
}

/// New length drawn as a Gaussian in r^3 around the old cubed length
/// (the radial volume element is d(r^3/3), so this does not bias
/// against long spins). Returns `false` when the draw was non-positive
/// and the proposal must be rejected outright.
pub fn scaled_vector<const OPDIM: usize, R: Rng>(
    rng: &mut R,
    scale_delta: f64,
    vec: Phi<OPDIM>,
) -> (Phi<OPDIM>, bool) {
    assert!(OPDIM == 3, "scale proposals need three components");
    let r3 = vec.norm().powi(3);
    let gauss: f64 = rng.sample(StandardNormal);
    let new_r3 = r3 + scale_delta * gauss;
    if new_r3 <= 0.0 {
        (vec, false)
    } else {
        let scale = (new_r3 / r3).powf(1.0 / 3.0);
        (vec * scale, true)
    }
}

/// Combined rotation and length change in a single proposal.
pub fn rotated_scaled_vector<const OPDIM: usize, R: Rng>(
    rng: &mut R,
    angle_delta: f64,
    scale_delta: f64,
    vec: Phi<OPDIM>,
) -> (Phi<OPDIM>, bool) {
    assert!(OPDIM == 3, "rotate-and-scale proposals need three components");
    let r3 = vec.norm().powi(3);
    let gauss: f64 = rng.sample(StandardNormal);
    let new_r3 = r3 + scale_delta * gauss;
    if new_r3 <= 0.0 {
        return (vec, false);
    }
    let rotated = rotated_vector::<OPDIM, R>(rng, angle_delta, vec);
    let new_r = new_r3.powf(1.0 / 3.0);
    (rotated * (new_r / rotated.norm()), true)
}

/// Ring buffer of the most recent acceptance ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningAverage {
    values: VecDeque<f64>,
    capacity: usize,
    samples_added: u64,
}

impl RunningAverage {
    pub fn new(capacity: usize) -> Self {
        RunningAverage {
            values: VecDeque::with_capacity(capacity),
            capacity,
            samples_added: 0,
        }
    }

    pub fn add_value(&mut self, v: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(v);
        self.samples_added += 1;
    }

    pub fn get(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f64>() / self.values.len() as f64
        }
    }

    pub fn samples_added(&self) -> u64 {
        self.samples_added
    }
}

/// Number of recorded acceptance ratios between two adjustments.
pub const ACC_RATIO_ADJUSTMENT_SAMPLES: u64 = 100;

const INITIAL_PHI_DELTA: f64 = 0.5;
const MIN_PHI_DELTA: f64 = 0.01;
const MAX_PHI_DELTA: f64 = 3.0;
const PHI_DELTA_GROW_FACTOR: f64 = 1.05;
const PHI_DELTA_SHRINK_FACTOR: f64 = 0.95;

const INITIAL_ANGLE_DELTA: f64 = 0.0;
const MIN_ANGLE_DELTA: f64 = -1.0;
const MAX_ANGLE_DELTA: f64 = 0.975;

const INITIAL_SCALE_DELTA: f64 = 0.1;
const MIN_SCALE_DELTA: f64 = 0.02;
const MAX_SCALE_DELTA: f64 = 1.0;

/// Adaptive proposal widths, tuned during thermalization toward the
/// target acceptance ratio and frozen afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentState {
    pub phi_delta: f64,
    /// Lower bound on cos(theta) of the rotation cone; smaller values
    /// open the cone and lower the acceptance ratio.
    pub angle_delta: f64,
    /// Standard deviation of the Gaussian length proposal.
    pub scale_delta: f64,
    cur_min_angle_delta: f64,
    cur_max_angle_delta: f64,
    cur_min_scale_delta: f64,
    cur_max_scale_delta: f64,
    pub last_acc_ratio_local_phi: f64,
    target_acc_ratio: f64,
    box_ra: RunningAverage,
    rotate_ra: RunningAverage,
    scale_ra: RunningAverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Adapting {
    Box,
    Rotate,
    Scale,
}

impl AdjustmentState {
    pub fn new(target_acc_ratio: f64) -> Self {
        AdjustmentState {
            phi_delta: INITIAL_PHI_DELTA,
            angle_delta: INITIAL_ANGLE_DELTA,
            scale_delta: INITIAL_SCALE_DELTA,
            cur_min_angle_delta: MIN_ANGLE_DELTA,
            cur_max_angle_delta: MAX_ANGLE_DELTA,
            cur_min_scale_delta: MIN_SCALE_DELTA,
            cur_max_scale_delta: MAX_SCALE_DELTA,
            last_acc_ratio_local_phi: 0.0,
            target_acc_ratio,
            box_ra: RunningAverage::new(ACC_RATIO_ADJUSTMENT_SAMPLES as usize),
            rotate_ra: RunningAverage::new(ACC_RATIO_ADJUSTMENT_SAMPLES as usize),
            scale_ra: RunningAverage::new(ACC_RATIO_ADJUSTMENT_SAMPLES as usize),
        }
    }

    /// Record the acceptance ratio of the last slice update and, every
    /// `ACC_RATIO_ADJUSTMENT_SAMPLES` samples, move the relevant delta
    /// toward the target acceptance.
    pub fn record_and_adapt(
        &mut self,
        method: SpinProposalMethod,
        performed_sweeps: u64,
        adapt_scale_variance: bool,
    ) {
        let adapting = match method {
            SpinProposalMethod::Box => Adapting::Box,
            SpinProposalMethod::Rotate => Adapting::Rotate,
            SpinProposalMethod::Scale => Adapting::Scale,
            SpinProposalMethod::RotateThenScale => {
                // must match the move alternation in the slice update
                if performed_sweeps % 2 == 0 {
                    Adapting::Rotate
                } else {
                    Adapting::Scale
                }
            }
            SpinProposalMethod::RotateAndScale => {
                // alternate which knob is adjusted between intervals
                if performed_sweeps % (2 * ACC_RATIO_ADJUSTMENT_SAMPLES)
                    < ACC_RATIO_ADJUSTMENT_SAMPLES
                {
                    Adapting::Rotate
                } else {
                    Adapting::Scale
                }
            }
        };

        let last = self.last_acc_ratio_local_phi;
        let ra = match adapting {
            Adapting::Box => &mut self.box_ra,
            Adapting::Rotate => &mut self.rotate_ra,
            Adapting::Scale => &mut self.scale_ra,
        };
        ra.add_value(last);
        if ra.samples_added() % ACC_RATIO_ADJUSTMENT_SAMPLES != 0 {
            return;
        }
        let avg = ra.get();

        match adapting {
            Adapting::Box => {
                if avg < self.target_acc_ratio {
                    self.phi_delta *= PHI_DELTA_SHRINK_FACTOR;
                } else if avg > self.target_acc_ratio {
                    self.phi_delta *= PHI_DELTA_GROW_FACTOR;
                }
                self.phi_delta = self.phi_delta.clamp(MIN_PHI_DELTA, MAX_PHI_DELTA);
            }
            Adapting::Rotate => {
                // shrinking angle_delta opens the cone and lowers the
                // acceptance ratio
                if avg < self.target_acc_ratio && self.angle_delta < MAX_ANGLE_DELTA {
                    self.cur_min_angle_delta = self.angle_delta;
                    self.angle_delta += (self.cur_max_angle_delta - self.angle_delta) / 2.0;
                } else if avg > self.target_acc_ratio && self.angle_delta > MIN_ANGLE_DELTA {
                    self.cur_max_angle_delta = self.angle_delta;
                    self.angle_delta -= (self.angle_delta - self.cur_min_angle_delta) / 2.0;
                }
            }
            Adapting::Scale => {
                if !adapt_scale_variance {
                    return;
                }
                // a wider Gaussian lowers the acceptance ratio
                if avg > self.target_acc_ratio && self.scale_delta < MAX_SCALE_DELTA {
                    self.cur_min_scale_delta = self.scale_delta;
                    self.scale_delta += (self.cur_max_scale_delta - self.scale_delta) / 2.0;
                } else if avg < self.target_acc_ratio && self.scale_delta > MIN_SCALE_DELTA {
                    self.cur_max_scale_delta = self.scale_delta;
                    self.scale_delta -= (self.scale_delta - self.cur_min_scale_delta) / 2.0;
                }
            }
        }
    }

    pub fn recent_box_acc_ratio(&self) -> f64 {
        self.box_ra.get()
    }
}

/// Attempt/acceptance tallies of the global moves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStatistics {
    pub attempted_global_shifts: u64,
    pub accepted_global_shifts: u64,
    pub attempted_wolff_cluster_updates: u64,
    pub accepted_wolff_cluster_updates: u64,
    pub attempted_wolff_cluster_shift_updates: u64,
    pub accepted_wolff_cluster_shift_updates: u64,
    pub added_wolff_cluster_size: f64,
}

impl UpdateStatistics {
    pub fn global_shift_acc_ratio(&self) -> f64 {
        if self.attempted_global_shifts == 0 {
            0.0
        } else {
            self.accepted_global_shifts as f64 / self.attempted_global_shifts as f64
        }
    }

    pub fn wolff_acc_ratio(&self) -> f64 {
        if self.attempted_wolff_cluster_updates == 0 {
            0.0
        } else {
            self.accepted_wolff_cluster_updates as f64
                / self.attempted_wolff_cluster_updates as f64
        }
    }

    pub fn average_accepted_cluster_size(&self, repeat_wolff_per_sweep: usize) -> f64 {
        let accepted =
            self.accepted_wolff_cluster_updates + self.accepted_wolff_cluster_shift_updates;
        if accepted == 0 {
            0.0
        } else {
            self.added_wolff_cluster_size / (repeat_wolff_per_sweep as f64 * accepted as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn directions_are_normalized() {
        let mut rng = Pcg64::seed_from_u64(1);
        for _ in 0..100 {
            let d1 = random_direction::<1, _>(&mut rng);
            assert_relative_eq!(d1.norm(), 1.0, epsilon = 1e-14);
            let d2 = random_direction::<2, _>(&mut rng);
            assert_relative_eq!(d2.norm(), 1.0, epsilon = 1e-14);
            let d3 = random_direction::<3, _>(&mut rng);
            assert_relative_eq!(d3.norm(), 1.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn rotation_preserves_length_and_respects_cone() {
        let mut rng = Pcg64::seed_from_u64(2);
        let vec = Phi::<3>::new(0.3, -1.1, 0.7);
        let angle_delta = 0.6;
        for _ in 0..200 {
            let rotated = rotated_vector::<3, _>(&mut rng, angle_delta, vec);
            assert_relative_eq!(rotated.norm(), vec.norm(), epsilon = 1e-12);
            let cos_angle = rotated.dot(&vec) / (vec.norm() * rotated.norm());
            assert!(cos_angle >= angle_delta - 1e-12);
        }
    }

    #[test]
    fn scale_proposal_keeps_direction() {
        let mut rng = Pcg64::seed_from_u64(3);
        let vec = Phi::<3>::new(0.5, 0.4, -0.3);
        for _ in 0..100 {
            let (scaled, valid) = scaled_vector::<3, _>(&mut rng, 0.2, vec);
            if valid {
                let cos_angle = scaled.dot(&vec) / (scaled.norm() * vec.norm());
                assert_relative_eq!(cos_angle, 1.0, epsilon = 1e-12);
            } else {
                assert_relative_eq!((scaled - vec).norm(), 0.0);
            }
        }
    }

    #[test]
    fn running_average_window() {
        let mut ra = RunningAverage::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            ra.add_value(v);
        }
        assert_relative_eq!(ra.get(), 3.0);
        assert_eq!(ra.samples_added(), 4);
    }

    #[test]
    fn box_delta_shrinks_on_low_acceptance() {
        let mut ad = AdjustmentState::new(0.5);
        let before = ad.phi_delta;
        ad.last_acc_ratio_local_phi = 0.1;
        for sweep in 0..ACC_RATIO_ADJUSTMENT_SAMPLES {
            ad.record_and_adapt(SpinProposalMethod::Box, sweep, true);
        }
        assert!(ad.phi_delta < before);
    }

    #[test]
    fn box_delta_grows_on_high_acceptance_and_is_clamped() {
        let mut ad = AdjustmentState::new(0.5);
        ad.last_acc_ratio_local_phi = 0.99;
        for round in 0..2000 {
            ad.record_and_adapt(SpinProposalMethod::Box, round, true);
        }
        assert!(ad.phi_delta <= MAX_PHI_DELTA + 1e-12);
        assert!(ad.phi_delta > INITIAL_PHI_DELTA);
    }

    #[test]
    fn rotate_adjustment_narrows_cone_on_low_acceptance() {
        let mut ad = AdjustmentState::new(0.5);
        let before = ad.angle_delta;
        ad.last_acc_ratio_local_phi = 0.05;
        for sweep in 0..ACC_RATIO_ADJUSTMENT_SAMPLES {
            ad.record_and_adapt(SpinProposalMethod::Rotate, sweep, true);
        }
        // raising angle_delta narrows the cone, raising acceptance
        assert!(ad.angle_delta > before);
        assert!(ad.angle_delta <= MAX_ANGLE_DELTA);
    }
}
