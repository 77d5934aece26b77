use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::warn;

use crate::error::{MiicError, MiicResult};
use crate::interpolation::{InterpolationScheme, InterpolationTable};
use crate::signal::cosine_taper;

//=====================================================================
// Velocity change estimation by stretching. Correlation functions are
// compared with stretched copies of a reference trace, the stretch of
// the best match is the negative relative velocity change.
//=====================================================================

/// Which part of the correlation functions is compared. All but `Single`
/// assume zero lag in the centre of the trace, `Single` on the first sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Sides {
    #[default]
    Both,
    Left,
    Right,
    Single,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StretchParams {
    /// Stretches from `-stretch_range` to `stretch_range` are tested.
    pub stretch_range: f64,
    pub stretch_steps: usize,
    pub sides: Sides,
    /// Replace NaN samples by zero before comparing.
    pub remove_nans: bool,
}

impl Default for StretchParams {
    fn default() -> Self {
        Self { stretch_range: 0.1, stretch_steps: 100, sides: Sides::Both, remove_nans: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StretchEstimate {
    /// Best similarity, shape (correlation functions, time windows).
    pub corr: Array2<f64>,
    /// Stretch of the best match, same shape as `corr`.
    pub value: Array2<f64>,
    /// Similarity for every (correlation function, stretch, time window).
    pub sim_mat: Array3<f64>,
    /// Tested stretches.
    pub second_axis: Array1<f64>,
}

/// Sample indices of time windows starting at `starts`. `widths` holds
/// either one length for all windows or one per window.
pub fn time_windows_creation(starts: &[usize], widths: &[usize]) -> MiicResult<Vec<Vec<usize>>> {
    if widths.len() != 1 && widths.len() != starts.len() {
        return Err(MiicError::invalid(format!(
            "need one window width or one per start ({}), got {}", starts.len(), widths.len()
        )));
    }
    Ok(starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let width = if widths.len() == 1 { widths[0] } else { widths[i] };
            (start..start + width).collect()
        })
        .collect())
}

// Indices of the samples selected by a window, counted from zero lag
fn window_indices(window: &[usize], npts: usize, sides: Sides) -> Vec<usize> {
    let center = npts.saturating_sub(1) / 2;
    let mut mask = vec![false; npts];
    let mut select = |idx: Option<usize>| {
        if let Some(idx) = idx.filter(|idx| *idx < npts) {
            mask[idx] = true;
        }
    };
    for &t in window {
        match sides {
            Sides::Both => {
                select(center.checked_sub(t));
                select(Some(center + t));
            }
            Sides::Left => select(center.checked_sub(t)),
            Sides::Right => select(Some(center + t)),
            Sides::Single => select(Some(t)),
        }
    }
    mask.iter().enumerate().filter(|(_, selected)| **selected).map(|(idx, _)| idx).collect()
}

fn nan_to_num(data: ArrayView2<f64>) -> Array2<f64> {
    data.mapv(|v| if v.is_nan() { 0.0 } else { v })
}

/// Compare every row of `mat` with every row of `strrefmat`, the
/// reference stretched by the amounts in `strvec`, inside each window of `tw`.
pub fn velocity_change_estimate(
    mat: ArrayView2<f64>,
    tw: &[Vec<usize>],
    strrefmat: ArrayView2<f64>,
    strvec: ArrayView1<f64>,
    sides: Sides,
    remove_nans: bool,
) -> MiicResult<StretchEstimate> {
    if strrefmat.ncols() != mat.ncols() {
        return Err(MiicError::shape(&[mat.ncols()], &[strrefmat.ncols()]));
    }
    if strvec.len() != strrefmat.nrows() {
        return Err(MiicError::shape(&[strrefmat.nrows()], &[strvec.len()]));
    }
    let mat = if remove_nans { nan_to_num(mat) } else { mat.to_owned() };
    let (nrows, nstr) = (mat.nrows(), strrefmat.nrows());

    let mut corr = Array2::from_elem((nrows, tw.len()), f64::NAN);
    let mut value = Array2::from_elem((nrows, tw.len()), f64::NAN);
    let mut sim_mat = Array3::from_elem((nrows, nstr, tw.len()), f64::NAN);
    for (ii, window) in tw.iter().enumerate() {
        let indices = window_indices(window, mat.ncols(), sides);
        let ref_energy: Vec<f64> = strrefmat
            .outer_iter()
            .map(|reference| indices.iter().map(|&j| reference[j] * reference[j]).sum())
            .collect();

        let similarities: Vec<Vec<f64>> = (0..nrows)
            .into_par_iter()
            .map(|r| {
                let row = mat.row(r);
                let energy: f64 = indices.iter().map(|&j| row[j] * row[j]).sum();
                strrefmat
                    .outer_iter()
                    .zip(&ref_energy)
                    .map(|(reference, ref_energy)| {
                        let dot: f64 = indices.iter().map(|&j| row[j] * reference[j]).sum();
                        dot / (energy * ref_energy).sqrt()
                    })
                    .collect()
            })
            .collect();

        for (r, row_sims) in similarities.iter().enumerate() {
            let best = row_sims
                .iter()
                .enumerate()
                .filter(|(_, sim)| !sim.is_nan())
                .max_by(|a, b| a.1.total_cmp(b.1));
            if let Some((k, sim)) = best {
                corr[[r, ii]] = *sim;
                value[[r, ii]] = strvec[k];
            }
            for (k, sim) in row_sims.iter().enumerate() {
                sim_mat[[r, k, ii]] = *sim;
            }
        }
    }
    Ok(StretchEstimate { corr, value, sim_mat, second_axis: strvec.to_owned() })
}

/// Stretch estimate against a reference trace interpolated with a cubic
/// spline. The reference defaults to the mean of all rows, the time window
/// to the whole trace.
pub fn time_stretch_estimate(
    corr_data: ArrayView2<f64>,
    ref_trc: Option<ArrayView1<f64>>,
    tw: Option<&[Vec<usize>]>,
    params: &StretchParams,
) -> MiicResult<StretchEstimate> {
    let mat = if params.remove_nans { nan_to_num(corr_data) } else { corr_data.to_owned() };
    let npts = mat.ncols();
    if npts == 0 || mat.nrows() == 0 {
        return Err(MiicError::NoData("empty correlation matrix".into()));
    }
    if params.stretch_steps == 0 {
        return Err(MiicError::invalid("at least one stretch step is needed"));
    }

    let mut reference = match ref_trc {
        Some(reference) => reference.to_owned(),
        None => mat.sum_axis(Axis(0)) / mat.nrows() as f64,
    };
    if reference.len() != npts {
        return Err(MiicError::shape(&[npts], &[reference.len()]));
    }
    if params.remove_nans {
        reference.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
    }
    reference *= &cosine_taper(npts, 0.05)?;

    let default_tw = vec![(0..npts / 2).collect::<Vec<usize>>()];
    let tw = tw.unwrap_or(&default_tw);

    let stretches = Array1::linspace(-params.stretch_range, params.stretch_range, params.stretch_steps);
    let time_idx: Vec<f64> = match params.sides {
        Sides::Single => (0..npts).map(|i| i as f64).collect(),
        _ => (0..npts).map(|i| i as f64 - (npts as f64 - 1.0) / 2.0).collect(),
    };
    let spline = InterpolationTable::from_x_and_y(&time_idx, &reference.to_vec(), InterpolationScheme::CubicSpline)?;

    let mut ref_stretch = Array2::zeros((stretches.len(), npts));
    for (mut row, stretch) in ref_stretch.outer_iter_mut().zip(stretches.iter()) {
        let factor = (-stretch).exp();
        for (value, t) in row.iter_mut().zip(&time_idx) {
            *value = spline.evaluate(t * factor);
        }
    }
    velocity_change_estimate(mat.view(), tw, ref_stretch.view(), stretches.view(), params.sides, false)
}

/// Stretch estimates against several references, keyed `reftr_<i>`.
pub fn multi_ref_vchange(
    corr_data: ArrayView2<f64>,
    ref_trs: ArrayView2<f64>,
    tw: Option<&[Vec<usize>]>,
    params: &StretchParams,
) -> MiicResult<BTreeMap<String, StretchEstimate>> {
    let estimates = (0..ref_trs.nrows())
        .into_par_iter()
        .map(|i| {
            let estimate = time_stretch_estimate(corr_data, Some(ref_trs.row(i)), tw, params)?;
            Ok((format!("reftr_{}", i), estimate))
        })
        .collect::<MiicResult<Vec<_>>>()?;
    Ok(estimates.into_iter().collect())
}

/// Weighted mean offset between two velocity change curves measured
/// against different references. Points are weighted by their inverse
/// variance derived from the correlation values. Returns the combined
/// correlation and the shift.
pub fn est_shift_from_dt_corr(
    dt1: ArrayView1<f64>,
    dt2: ArrayView1<f64>,
    corr1: ArrayView1<f64>,
    corr2: ArrayView1<f64>,
) -> MiicResult<(f64, f64)> {
    if dt1.len() != dt2.len() || corr1.len() != dt1.len() || corr2.len() != dt1.len() {
        return Err(MiicError::shape(&[dt1.len(), dt2.len()], &[corr1.len(), corr2.len()]));
    }
    let variance = |c: f64| (1.0 - c * c) / (4.0 * c * c);

    let (mut weight_sum, mut shift, mut comb_corr) = (0.0, 0.0, 0.0);
    for i in 0..dt1.len() {
        let (d1, d2, c1, c2) = (dt1[i], dt2[i], corr1[i], corr2[i]);
        if ![d1, d2, c1, c2].iter().all(|v| v.is_finite()) || c1 <= 0.0 || c2 <= 0.0 {
            continue;
        }
        // perfectly correlated points have no variance
        if c1 > 0.999 && c2 > 0.999 {
            continue;
        }
        let weight = 1.0 / (variance(c1) + variance(c2));
        weight_sum += weight;
        shift += (d1 - d2) * weight;
        comb_corr += (c1 + c2) * weight;
    }
    Ok((comb_corr / weight_sum, shift / weight_sum))
}

/// Design matrix relating the pairwise reference offsets to the offsets
/// of references `1..n_ref` against reference 0. One row per ordered pair
/// `(j, k)` with `j != k`, in the order the pairs are visited.
fn create_g(n_ref: usize) -> Array2<f64> {
    let unknowns = n_ref.saturating_sub(1);
    let mut g = Array2::zeros((n_ref * unknowns, unknowns));
    let mut row = 0;
    for j in 0..n_ref {
        for k in (0..n_ref).filter(|k| *k != j) {
            if j > 0 {
                g[[row, j - 1]] = -1.0;
            }
            if k > 0 {
                g[[row, k - 1]] = 1.0;
            }
            row += 1;
        }
    }
    g
}

// Gaussian elimination with partial pivoting for the small normal equations
fn solve_linear(mut a: Array2<f64>, mut b: Array1<f64>) -> MiicResult<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|x, y| a[[*x, col]].abs().total_cmp(&a[[*y, col]].abs()))
            .filter(|p| a[[*p, col]].abs() > 1e-12)
            .ok_or_else(|| MiicError::invalid("reference offsets are not constrained by the measurements"))?;
        if pivot != col {
            for j in 0..n {
                a.swap([col, j], [pivot, j]);
            }
            b.swap(col, pivot);
        }
        for r in col + 1..n {
            let factor = a[[r, col]] / a[[col, col]];
            for j in col..n {
                a[[r, j]] -= factor * a[[col, j]];
            }
            b[r] -= factor * b[col];
        }
    }
    let mut x = Array1::zeros(n);
    for r in (0..n).rev() {
        let tail: f64 = (r + 1..n).map(|j| a[[r, j]] * x[j]).sum();
        x[r] = (b[r] - tail) / a[[r, r]];
    }
    Ok(x)
}

/// Offsets that align the estimates of a multi reference panel, one per
/// reference in key order. They are the weighted least squares solution of
/// the pairwise shifts from [`est_shift_from_dt_corr`], with zero mean.
/// Only the first time window is used.
pub fn reftr_shifts(multi_ref_panel: &BTreeMap<String, StretchEstimate>) -> MiicResult<Array1<f64>> {
    let estimates: Vec<&StretchEstimate> = multi_ref_panel.values().collect();
    let n_ref = estimates.len();
    if n_ref < 2 {
        return Ok(Array1::zeros(n_ref));
    }

    let (mut weights, mut shifts) = (Vec::new(), Vec::new());
    for (j, first) in estimates.iter().enumerate() {
        for (_, second) in estimates.iter().enumerate().filter(|(k, _)| *k != j) {
            let (corr, shift) = est_shift_from_dt_corr(
                first.value.column(0),
                second.value.column(0),
                first.corr.column(0),
                second.corr.column(0),
            )?;
            weights.push(if corr.is_finite() { corr } else { 0.0 });
            shifts.push(if shift.is_finite() { shift } else { 0.0 });
        }
    }

    let g = create_g(n_ref);
    let gtw = &g.t() * &Array1::from(weights);
    let normal = gtw.dot(&g);
    let rhs = gtw.dot(&Array1::from(shifts));
    let solved = solve_linear(normal, rhs)?;

    let mut offsets = Array1::zeros(n_ref);
    offsets.slice_mut(s![1..]).assign(&solved);
    let mean = offsets.mean().unwrap_or(0.0);
    Ok(offsets - mean)
}

/// Combine the estimates of a multi reference panel into one. Every
/// similarity matrix is rolled along the stretch axis by its reference
/// offset and the finite values are averaged. The crest of the mean
/// matrix gives the combined stretch and correlation.
pub fn estimate_reftr_shifts_from_dt_corr(
    multi_ref_panel: &BTreeMap<String, StretchEstimate>,
) -> MiicResult<StretchEstimate> {
    let first = multi_ref_panel
        .values()
        .next()
        .ok_or_else(|| MiicError::NoData("empty multi reference panel".into()))?;
    let second_axis = first.second_axis.clone();
    if second_axis.len() < 2 {
        return Err(MiicError::invalid("at least two stretch steps are needed to align references"));
    }
    let delta = second_axis[1] - second_axis[0];
    let (nrows, nstr) = (first.sim_mat.len_of(Axis(0)), second_axis.len());

    let offsets = reftr_shifts(multi_ref_panel)?;
    let mut sum = Array2::<f64>::zeros((nrows, nstr));
    let mut count = Array2::<f64>::zeros((nrows, nstr));
    for (estimate, offset) in multi_ref_panel.values().zip(offsets.iter()) {
        if estimate.sim_mat.dim() != first.sim_mat.dim() {
            return Err(MiicError::shape(&[nrows, nstr], &[estimate.sim_mat.len_of(Axis(0)), estimate.sim_mat.len_of(Axis(1))]));
        }
        let roll = (offset / delta).round() as i64;
        let sim_mat = estimate.sim_mat.index_axis(Axis(2), 0);
        for r in 0..nrows {
            for k in 0..nstr {
                let value = sim_mat[[r, k]];
                if value.is_finite() {
                    let target = (k as i64 + roll).rem_euclid(nstr as i64) as usize;
                    sum[[r, target]] += value;
                    count[[r, target]] += 1.0;
                }
            }
        }
    }
    let mean = Zip::from(&sum).and(&count).map_collect(|s, c| if *c > 0.0 { s / c } else { f64::NAN });

    let mut corr = Array2::from_elem((nrows, 1), f64::NAN);
    let mut value = Array2::from_elem((nrows, 1), f64::NAN);
    for (r, row) in mean.outer_iter().enumerate() {
        let best = row.iter().enumerate().filter(|(_, v)| !v.is_nan()).max_by(|a, b| a.1.total_cmp(b.1));
        if let Some((k, sim)) = best {
            corr[[r, 0]] = *sim;
            value[[r, 0]] = second_axis[k];
        }
    }
    Ok(StretchEstimate { corr, value, sim_mat: mean.insert_axis(Axis(2)), second_axis })
}

/// Stretch estimates against every row of `ref_trs`, aligned and combined
/// into one estimate. Only the first time window is used.
pub fn multi_ref_vchange_and_align(
    corr_data: ArrayView2<f64>,
    ref_trs: ArrayView2<f64>,
    tw: Option<&[Vec<usize>]>,
    params: &StretchParams,
) -> MiicResult<StretchEstimate> {
    let tw = match tw {
        Some(windows) if windows.len() > 1 => {
            warn!("Multi reference alignment uses only the first of {} time windows", windows.len());
            Some(&windows[..1])
        }
        other => other,
    };
    let mut panel = multi_ref_vchange(corr_data, ref_trs, tw, params)?;
    match panel.len() {
        0 => Err(MiicError::NoData("no reference traces".into())),
        1 => panel.remove("reftr_0").ok_or_else(|| MiicError::NoData("missing reftr_0".into())),
        _ => estimate_reftr_shifts_from_dt_corr(&panel),
    }
}
