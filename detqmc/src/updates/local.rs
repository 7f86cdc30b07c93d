//! Per-slice Metropolis updates of the auxiliary fields with O(N^2)
//! in-place updates of the Green's function.
//!
//! Three strategies fold an accepted single-site change into G: an
//! iterative Sherman-Morrison scheme accumulating rank-one corrections
//! across the block rows, the explicit Woodbury formula on the
//! MSF x MSF block, and a delayed scheme that batches accepted updates
//! into rank-(MSF j) outer products applied in one burst.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::action::delta_s_phi;
use crate::config::{SpinProposalMethod, UpdateMethod};
use crate::fields::{cdwl_gamma, draw_cdwl, Phi};
use crate::replica::Replica;
use crate::scalar::GreenScalar;
use crate::updates::{rotated_scaled_vector, rotated_vector, scaled_vector};

/// What a proposal wants to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Changed {
    None,
    Phi,
    Cdwl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProposalKind {
    Box,
    Rotate,
    Scale,
    RotateAndScale,
    Cdwl,
}

impl<S: GreenScalar, const OPDIM: usize> Replica<S, OPDIM> {
    /// Update the fields of one imaginary-time slice. During
    /// thermalization the acceptance ratio additionally feeds the
    /// adaptive proposal widths.
    pub(crate) fn update_in_slice(&mut self, k: usize, thermalization: bool) {
        if !self.pars.phi_fixed {
            for _ in 0..self.pars.repeat_update_in_slice {
                let kind = match self.pars.spin_proposal_method {
                    SpinProposalMethod::Box => ProposalKind::Box,
                    SpinProposalMethod::Rotate => ProposalKind::Rotate,
                    SpinProposalMethod::Scale => ProposalKind::Scale,
                    SpinProposalMethod::RotateThenScale => {
                        // alternate between rotating and scaling sweeps
                        if self.performed_sweeps % 2 == 0 {
                            ProposalKind::Rotate
                        } else {
                            ProposalKind::Scale
                        }
                    }
                    SpinProposalMethod::RotateAndScale => ProposalKind::RotateAndScale,
                };
                self.ad.last_acc_ratio_local_phi = self.run_update_method(k, kind);
            }

            if !self.pars.turnoff_fermions && self.pars.cdw_u != 0.0 {
                // resample the discrete field; this acceptance ratio is
                // not fed into the adjustment
                self.run_update_method(k, ProposalKind::Cdwl);
            }

            if thermalization {
                self.ad.record_and_adapt(
                    self.pars.spin_proposal_method,
                    self.performed_sweeps,
                    self.pars.adapt_scale_variance,
                );
            }
        }
    }

    fn run_update_method(&mut self, k: usize, kind: ProposalKind) -> f64 {
        match self.pars.update_method {
            UpdateMethod::Iterative => self.update_in_slice_iterative(k, kind),
            UpdateMethod::Woodbury => self.update_in_slice_woodbury(k, kind),
            UpdateMethod::Delayed => {
                if self.pars.turnoff_fermions {
                    // nothing to delay without a Green's function
                    self.update_in_slice_woodbury(k, kind)
                } else {
                    self.update_in_slice_delayed(k, kind)
                }
            }
        }
    }

    fn propose_local_update(
        &mut self,
        kind: ProposalKind,
        site: usize,
        k: usize,
    ) -> (Changed, Phi<OPDIM>, i32) {
        let old_phi = self.field.phi(site, k);
        let old_cdwl = self.field.cdwl(site, k);
        match kind {
            ProposalKind::Box => {
                let mut phi = old_phi;
                let delta = self.ad.phi_delta;
                for dim in 0..OPDIM {
                    phi[dim] += self.rng.gen_range(-delta..delta);
                }
                (Changed::Phi, phi, old_cdwl)
            }
            ProposalKind::Rotate => {
                let phi = rotated_vector::<OPDIM, _>(&mut self.rng, self.ad.angle_delta, old_phi);
                (Changed::Phi, phi, old_cdwl)
            }
            ProposalKind::Scale => {
                let (phi, valid) =
                    scaled_vector::<OPDIM, _>(&mut self.rng, self.ad.scale_delta, old_phi);
                (if valid { Changed::Phi } else { Changed::None }, phi, old_cdwl)
            }
            ProposalKind::RotateAndScale => {
                let (phi, valid) = rotated_scaled_vector::<OPDIM, _>(
                    &mut self.rng,
                    self.ad.angle_delta,
                    self.ad.scale_delta,
                    old_phi,
                );
                (if valid { Changed::Phi } else { Changed::None }, phi, old_cdwl)
            }
            ProposalKind::Cdwl => (Changed::Cdwl, old_phi, draw_cdwl(&mut self.rng)),
        }
    }

    fn bosonic_acceptance_factor(&self, changed: Changed, site: usize, k: usize, new_phi: Phi<OPDIM>) -> f64 {
        if changed == Changed::Phi {
            let dsphi = delta_s_phi(
                &self.pars, &self.field, &self.lat, &self.chain, site, k, new_phi,
            );
            (-dsphi).exp()
        } else {
            1.0
        }
    }

    fn fermion_prob_from_det(&self, det: S) -> f64 {
        if self.pars.matrix_size_factor() == 4 {
            det.real()
        } else {
            // det diag(G, G*) = |det G|^2
            let m = det.modulus();
            m * m
        }
    }

    /// Woodbury update: explicit inverse of the MSF x MSF matrix
    /// `M = I + (I - G_ii) Delta_i`.
    fn update_in_slice_woodbury(&mut self, k: usize, kind: ProposalKind) -> f64 {
        let n = self.pars.num_sites();
        let msf = self.pars.matrix_size_factor();
        let mut accratio = 0.0;

        for site in 0..n {
            let (changed, new_phi, new_cdwl) = self.propose_local_update(kind, site, k);
            if changed == Changed::None {
                continue;
            }
            let prob_phi = self.bosonic_acceptance_factor(changed, site, k, new_phi);

            let mut prob_fermion = 1.0;
            let mut prob_cdwl = 1.0;
            let mut fermion_update: Option<(DMatrix<S>, DMatrix<S>)> = None;
            if !self.pars.turnoff_fermions {
                let delta = self.bmat().delta_for_site(new_phi, new_cdwl, k, site);

                let mut g_sub = DMatrix::from_element(msf, msf, S::from_real(0.0));
                for a in 0..msf {
                    for b in 0..msf {
                        g_sub[(a, b)] = self.g[(site + a * n, site + b * n)];
                    }
                }
                let i_minus_g = DMatrix::<S>::identity(msf, msf) - g_sub;
                let m_small = DMatrix::<S>::identity(msf, msf) + &i_minus_g * &delta;
                let det = m_small.determinant();
                let det_mod = det.modulus();
                if !det_mod.is_finite() || det_mod == 0.0 {
                    // singular M: drop this proposal without touching
                    // any state
                    continue;
                }
                let m_inv = match m_small.try_inverse() {
                    Some(mi) => mi,
                    None => continue,
                };
                prob_fermion = self.fermion_prob_from_det(det);
                prob_cdwl = cdwl_gamma(new_cdwl) / cdwl_gamma(self.field.cdwl(site, k));
                fermion_update = Some((delta, m_inv));
            }

            let prob = prob_phi * prob_fermion * prob_cdwl;
            if prob > 1.0 || self.rng.gen::<f64>() < prob {
                accratio += 1.0;
                self.field.set_phi(site, k, new_phi);

                if let Some((delta, m_inv)) = fermion_update {
                    self.field.set_cdwl(site, k, new_cdwl);
                    self.field.update_cosh_sinh_terms(site, k);

                    // G' = G + (G_{.,i} Delta) M^{-1} (G_{i,.} - I_{i,.})
                    let mut mat_v = DMatrix::from_element(msf, msf * n, S::from_real(0.0));
                    for r in 0..msf {
                        mat_v.row_mut(r).copy_from(&self.g.row(site + r * n));
                        mat_v[(r, site + r * n)] -= S::one();
                    }
                    let mut g_times_u = DMatrix::from_element(msf * n, msf, S::from_real(0.0));
                    for c in 0..msf {
                        g_times_u.column_mut(c).copy_from(&self.g.column(site + c * n));
                    }
                    let g_times_u = g_times_u * &delta;
                    self.g += g_times_u * (m_inv * mat_v);
                }
            }
        }
        accratio / n as f64
    }

    /// Iterative Sherman-Morrison update accumulating rank-one
    /// corrections across the MSF block rows of `Delta (I - G)`.
    fn update_in_slice_iterative(&mut self, k: usize, kind: ProposalKind) -> f64 {
        let n = self.pars.num_sites();
        let msf = self.pars.matrix_size_factor();
        let mut accratio = 0.0;

        for site in 0..n {
            let (changed, new_phi, new_cdwl) = self.propose_local_update(kind, site, k);
            if changed == Changed::None {
                continue;
            }
            let prob_phi = self.bosonic_acceptance_factor(changed, site, k, new_phi);

            let mut prob_fermion = 1.0;
            let mut prob_cdwl = 1.0;
            let mut rows: Vec<DVector<S>> = Vec::new();
            let mut singular = false;
            if !self.pars.turnoff_fermions {
                let delta = self.bmat().delta_for_site(new_phi, new_cdwl, k, site);

                // the rows site + r N of Delta (I - G), each O(MSF N)
                rows = (0..msf)
                    .map(|r| {
                        let mut row = DVector::from_element(msf * n, S::from_real(0.0));
                        for dc in 0..msf {
                            let coef = delta[(r, dc)];
                            for col in 0..msf * n {
                                row[col] -= coef * self.g[(site + dc * n, col)];
                            }
                            row[site + dc * n] += coef;
                        }
                        row
                    })
                    .collect();

                // turn rows[] into the corresponding rows of
                // [I + Delta (I - G)]^{-1}, collecting the determinant
                // on the way
                let mut det = S::one();
                for l in 0..msf {
                    let mut row = rows[l].clone();
                    for kk in 0..l {
                        row[site + kk * n] = S::from_real(0.0);
                    }
                    for kk in 0..l {
                        let coef = rows[l][site + kk * n];
                        row += &rows[kk] * coef;
                    }
                    let divisor = S::one() + row[site + l * n];
                    let dm = divisor.modulus();
                    if dm == 0.0 || !dm.is_finite() {
                        singular = true;
                        break;
                    }
                    det *= divisor;
                    let mut new_row = &row * (-(S::one() / divisor));
                    new_row[site + l * n] += S::one();
                    for kk in 0..l {
                        let coef = rows[kk][site + l * n] / divisor;
                        let updated = &rows[kk] - &row * coef;
                        rows[kk] = updated;
                    }
                    rows[l] = new_row;
                }
                if singular {
                    continue;
                }
                prob_fermion = self.fermion_prob_from_det(det);
                prob_cdwl = cdwl_gamma(new_cdwl) / cdwl_gamma(self.field.cdwl(site, k));
            }

            let prob = prob_phi * prob_fermion * prob_cdwl;
            if prob > 1.0 || self.rng.gen::<f64>() < prob {
                accratio += 1.0;
                self.field.set_phi(site, k, new_phi);

                if !self.pars.turnoff_fermions {
                    self.field.set_cdwl(site, k, new_cdwl);
                    self.field.update_cosh_sinh_terms(site, k);

                    // remove the unit diagonal already contained in the
                    // inverse rows
                    for r in 0..msf {
                        rows[r][site + r * n] -= S::one();
                    }
                    // G' = G [I + invRows], applied as one product of
                    // the old columns with the correction rows
                    let mut g_cols = DMatrix::from_element(msf * n, msf, S::from_real(0.0));
                    for r in 0..msf {
                        g_cols.column_mut(r).copy_from(&self.g.column(site + r * n));
                    }
                    let mut rows_mat = DMatrix::from_element(msf, msf * n, S::from_real(0.0));
                    for r in 0..msf {
                        rows_mat.row_mut(r).copy_from(&rows[r].transpose());
                    }
                    self.g += g_cols * rows_mat;
                }
            }
        }
        accratio / n as f64
    }

    /// Delayed update: accumulate columns X and rows Y of accepted
    /// updates, apply `G += X Y` once per batch of `delay_steps` sites.
    fn update_in_slice_delayed(&mut self, k: usize, kind: ProposalKind) -> f64 {
        let n = self.pars.num_sites();
        let msf = self.pars.matrix_size_factor();
        let delay = self.pars.delay_steps;
        let mut accratio = 0.0;

        let mut site = 0;
        while site < n {
            let delay_now = delay.min(n - site);
            let mut x = DMatrix::from_element(msf * n, msf * delay_now, S::from_real(0.0));
            let mut y = DMatrix::from_element(msf * delay_now, msf * n, S::from_real(0.0));
            let mut j = 0;

            while j < delay_now && site < n {
                let (changed, new_phi, new_cdwl) = self.propose_local_update(kind, site, k);
                if changed != Changed::None {
                    let prob_phi = self.bosonic_acceptance_factor(changed, site, k, new_phi);
                    let delta = self.bmat().delta_for_site(new_phi, new_cdwl, k, site);

                    // R_j: rows of the effective G including the not yet
                    // applied corrections
                    let mut rj = DMatrix::from_element(msf, msf * n, S::from_real(0.0));
                    for r in 0..msf {
                        rj.row_mut(r).copy_from(&self.g.row(site + r * n));
                    }
                    for l in 0..j {
                        let mut xb_site = DMatrix::from_element(msf, msf, S::from_real(0.0));
                        for r in 0..msf {
                            xb_site
                                .row_mut(r)
                                .copy_from(&x.view((site + r * n, msf * l), (1, msf)));
                        }
                        rj += xb_site * y.rows(msf * l, msf);
                    }
                    let mut sj = DMatrix::from_element(msf, msf, S::from_real(0.0));
                    for c in 0..msf {
                        sj.column_mut(c).copy_from(&rj.column(site + c * n));
                    }

                    let mj = DMatrix::<S>::identity(msf, msf) - &sj * &delta + &delta;
                    let det = mj.determinant();
                    let det_mod = det.modulus();
                    if det_mod == 0.0 || !det_mod.is_finite() {
                        site += 1;
                        continue;
                    }
                    let mj_inv = match mj.try_inverse() {
                        Some(mi) => mi,
                        None => {
                            site += 1;
                            continue;
                        }
                    };
                    let prob_fermion = self.fermion_prob_from_det(det);
                    let prob_cdwl =
                        cdwl_gamma(new_cdwl) / cdwl_gamma(self.field.cdwl(site, k));

                    let prob = prob_phi * prob_fermion * prob_cdwl;
                    if prob > 1.0 || self.rng.gen::<f64>() < prob {
                        accratio += 1.0;
                        self.field.set_phi(site, k, new_phi);
                        self.field.set_cdwl(site, k, new_cdwl);
                        self.field.update_cosh_sinh_terms(site, k);

                        // C_j: columns of the effective G at this site
                        let mut cj = DMatrix::from_element(msf * n, msf, S::from_real(0.0));
                        for c in 0..msf {
                            cj.column_mut(c).copy_from(&self.g.column(site + c * n));
                        }
                        for l in 0..j {
                            let mut yb_site =
                                DMatrix::from_element(msf, msf, S::from_real(0.0));
                            for c in 0..msf {
                                yb_site
                                    .column_mut(c)
                                    .copy_from(&y.view((msf * l, site + c * n), (msf, 1)));
                            }
                            cj += x.columns(msf * l, msf) * yb_site;
                        }
                        // R_j - Id rows, for the new Y block
                        for rc in 0..msf {
                            rj[(rc, site + rc * n)] -= S::one();
                        }

                        let xj = cj * &delta;
                        let yj = mj_inv * rj;
                        x.view_mut((0, msf * j), (msf * n, msf)).copy_from(&xj);
                        y.view_mut((msf * j, 0), (msf, msf * n)).copy_from(&yj);
                        j += 1;
                    }
                }
                site += 1;
            }

            if j > 0 {
                // one O(N^2 j) burst applies the whole batch
                self.g += x.columns(0, msf * j) * y.rows(0, msf * j);
            }
        }
        accratio / n as f64
    }
}
