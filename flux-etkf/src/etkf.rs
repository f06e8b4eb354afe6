
//! Reduced-rank square-root analysis. One factorization per
//! observation window; every operator derives from it.

use nd::{Array, ArrayBase, ArrayView, Ix1, Ix2, Axis, LinalgScalar};
use nd::linalg::general_mat_mul;

use linxal::types::LinxalImplScalar;
use linxal::svd::general::SVD;

use num_traits::{Float, One, Zero};

use rayon::prelude::*;
use nd_par::prelude::*;

use ensemble::EnsembleInit;
use error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Factorization<E>
  where E: LinxalImplScalar,
{
  mean_x: Array<E, Ix1>,
  mean_y: Array<E, Ix1>,
  /// X / sqrt(xnorm)
  x: Array<E, Ix2>,
  /// Y / sqrt(xnorm)
  y: Array<E, Ix2>,
  /// sqrt(r)
  sqr: Array<E, Ix1>,
  snorm: E,

  u: Array<E, Ix2>,
  w: Array<E, Ix1>,
  vt: Array<E, Ix2>,
  /// 1 / (1 + w²)
  md: Array<E, Ix1>,
  /// Count of strictly positive singular values.
  n_wy: usize,
  uw: Array<E, Ix2>,
}

impl<E> Factorization<E>
  where E: LinxalImplScalar<RealPart = E> + SVD + Float,
        E: LinalgScalar,
        E: Send + Sync,
{
  pub fn compute(init: &EnsembleInit<E>) -> Result<Factorization<E>> {
    init.validate()?;

    let ne = init.ensemble_count();
    let ny = init.observation_count();

    let snorm = init.xnorm.sqrt();
    let x = init.x.to_owned().mapv_into(|v| v / snorm);
    let y = init.y.to_owned().mapv_into(|v| v / snorm);
    let sqr = init.r.to_owned().mapv_into(|v| v.sqrt());

    // Whitened transpose of the observation perturbations: member
    // rows, observation columns, each column divided by its error
    // standard deviation.
    let mut scyt: Array<E, Ix2> = ArrayBase::zeros((ne, ny));
    scyt.assign(&y.t());
    scyt.axis_iter_mut(Axis(1))
      .into_par_iter()
      .zip(sqr.axis_iter(Axis(0)).into_par_iter())
      .for_each(|(mut col, s)| {
        let s = s[()];
        col.mapv_inplace(|v| v / s);
      });

    let sol = SVD::compute_into(scyt, true, true)?;
    let w = sol.values;
    let u = sol.left_vectors.ok_or(Error::MissingSingularVectors)?;
    let vt = sol.right_vectors.ok_or(Error::MissingSingularVectors)?;

    let mut md: Array<E, Ix1> = ArrayBase::zeros(w.dim());
    for (i, dest) in md.indexed_iter_mut() {
      *dest = (E::one() + w[i] * w[i]).recip();
    }
    let n_wy = w.iter().take_while(|v| **v > E::zero()).count();

    let mut uw: Array<E, Ix2> = ArrayBase::zeros((ne, n_wy));
    for j in 0..n_wy {
      let wj = w[j];
      let mut col = uw.column_mut(j);
      col.assign(&u.column(j));
      col.mapv_inplace(|v| v * wj);
    }

    Ok(Factorization {
      mean_x: init.mean_x.to_owned(),
      mean_y: init.mean_y.to_owned(),
      x: x,
      y: y,
      sqr: sqr,
      snorm: snorm,
      u: u,
      w: w,
      vt: vt,
      md: md,
      n_wy: n_wy,
      uw: uw,
    })
  }

  /// On failure the held factorization is untouched and keeps
  /// serving the previous window's analysis; safe to retry.
  pub fn reset(&mut self, init: &EnsembleInit<E>) -> Result<()> {
    let next = Factorization::compute(init)?;
    *self = next;
    Ok(())
  }

  pub fn state_size(&self) -> usize { self.x.dim().0 }
  pub fn ensemble_count(&self) -> usize { self.x.dim().1 }
  pub fn observation_count(&self) -> usize { self.y.dim().0 }

  pub fn rank(&self) -> usize { self.n_wy }

  pub fn singular_values(&self) -> ArrayView<E, Ix1> { self.w.view() }
  pub fn mean_x(&self) -> ArrayView<E, Ix1> { self.mean_x.view() }
  pub fn mean_y(&self) -> ArrayView<E, Ix1> { self.mean_y.view() }

  pub fn scaled_ensemble(&self) -> ArrayView<E, Ix2> { self.x.view() }
  pub fn scaled_observation_ensemble(&self) -> ArrayView<E, Ix2> {
    self.y.view()
  }

  pub fn increment(&self, yobs: ArrayView<E, Ix1>) -> Result<Array<E, Ix1>> {
    let ny = self.observation_count();
    if yobs.dim() != ny {
      return Err(Error::Shape {
        what: "yobs",
        expected: ny,
        found: yobs.dim(),
      });
    }

    let mut dy: Array<E, Ix1> = ArrayBase::zeros(ny);
    for (i, dest) in dy.indexed_iter_mut() {
      *dest = (yobs[i] - self.mean_y[i]) / self.sqr[i];
    }

    let t = self.vt.dot(&dy);
    let mut ts: Array<E, Ix1> = ArrayBase::zeros(self.n_wy);
    for (i, dest) in ts.indexed_iter_mut() {
      *dest = self.md[i] * t[i];
    }

    Ok(self.uw.dot(&ts))
  }

  pub fn posterior(&self, yobs: ArrayView<E, Ix1>) -> Result<Array<E, Ix1>> {
    let inc_m = self.increment(yobs)?;
    let mut post = self.x.dot(&inc_m);
    post.scaled_add(E::one(), &self.mean_x);
    Ok(post)
  }

  /// T = U·diag(sqrt(md), 1, …)·Uᵗ
  pub fn transform_matrix(&self) -> Array<E, Ix2> {
    let ne = self.ensemble_count();
    let (u_r, _) = self.u.view().split_at(Axis(1), self.n_wy);

    let mut us = u_r.to_owned();
    for j in 0..self.n_wy {
      let scale = self.md[j].sqrt() - E::one();
      us.column_mut(j).mapv_inplace(|v| v * scale);
    }

    let mut tm: Array<E, Ix2> = Array::eye(ne);
    general_mat_mul(E::one(), &us, &u_r.t(), E::one(), &mut tm);
    tm
  }

  /// Explicit gain; O(nx·ny) to hold, `posterior` never forms it.
  pub fn gain_matrix(&self) -> Array<E, Ix2> {
    let ne = self.ensemble_count();
    let ny = self.observation_count();
    let nx = self.state_size();

    let (vt_r, _) = self.vt.view().split_at(Axis(0), self.n_wy);

    let mut g = self.uw.to_owned();
    for j in 0..self.n_wy {
      let scale = self.md[j];
      g.column_mut(j).mapv_inplace(|v| v * scale);
    }

    let mut per_obs: Array<E, Ix2> = ArrayBase::zeros((ne, ny));
    general_mat_mul(E::one(), &g, &vt_r, E::zero(), &mut per_obs);
    // Undo the whitening on the observation axis.
    per_obs.axis_iter_mut(Axis(1))
      .into_par_iter()
      .zip(self.sqr.axis_iter(Axis(0)).into_par_iter())
      .for_each(|(mut col, s)| {
        let s = s[()];
        col.mapv_inplace(|v| v / s);
      });

    let mut k: Array<E, Ix2> = ArrayBase::zeros((nx, ny));
    general_mat_mul(E::one(), &self.x, &per_obs, E::zero(), &mut k);
    k
  }

  /// With `aux_mean` absent the ensemble is taken as mean-removed.
  pub fn aux_increment(&self,
                       aux: ArrayView<E, Ix2>,
                       aux_mean: Option<ArrayView<E, Ix1>>,
                       inc_m: ArrayView<E, Ix1>)
                       -> Result<Array<E, Ix1>>
  {
    let ne = self.ensemble_count();
    if aux.dim().1 != ne {
      return Err(Error::Shape {
        what: "aux columns",
        expected: ne,
        found: aux.dim().1,
      });
    }
    if inc_m.dim() != ne {
      return Err(Error::Shape {
        what: "inc_m",
        expected: ne,
        found: inc_m.dim(),
      });
    }
    if let Some(ref m) = aux_mean {
      if m.dim() != aux.dim().0 {
        return Err(Error::Shape {
          what: "aux_mean",
          expected: aux.dim().0,
          found: m.dim(),
        });
      }
    }

    let snorm = self.snorm;
    let mut centered = aux.to_owned();
    if let Some(m) = aux_mean {
      for ((i, _), v) in centered.indexed_iter_mut() {
        *v = *v - m[i];
      }
    }
    centered.mapv_inplace(|v| v / snorm);

    Ok(centered.dot(&inc_m))
  }

  pub fn aux_observation_increment(&self,
                                   y_aux: ArrayView<E, Ix2>,
                                   inc_m: ArrayView<E, Ix1>,
                                   mean_y_aux: Option<ArrayView<E, Ix1>>)
                                   -> Result<Array<E, Ix1>>
  {
    self.aux_increment(y_aux, mean_y_aux, inc_m)
  }

  pub fn apply_transform(&self,
                         aux: ArrayView<E, Ix2>,
                         tm: &Array<E, Ix2>,
                         aux_mean: Option<ArrayView<E, Ix1>>)
                         -> Result<Array<E, Ix2>>
  {
    let ne = self.ensemble_count();
    if aux.dim().1 != ne {
      return Err(Error::Shape {
        what: "aux columns",
        expected: ne,
        found: aux.dim().1,
      });
    }
    if tm.dim() != (ne, ne) {
      return Err(Error::Shape {
        what: "tm",
        expected: ne,
        found: tm.dim().0,
      });
    }
    if let Some(ref m) = aux_mean {
      if m.dim() != aux.dim().0 {
        return Err(Error::Shape {
          what: "aux_mean",
          expected: aux.dim().0,
          found: m.dim(),
        });
      }
    }

    let mut centered = aux.to_owned();
    if let Some(m) = aux_mean {
      for ((i, _), v) in centered.indexed_iter_mut() {
        *v = *v - m[i];
      }
    }

    let mut out: Array<E, Ix2> = ArrayBase::zeros(centered.dim());
    general_mat_mul(E::one(), &centered, tm, E::zero(), &mut out);
    Ok(out)
  }
}

#[cfg(test)]
fn small_window() -> (Array<f64, Ix1>, Array<f64, Ix1>,
                      Array<f64, Ix2>, Array<f64, Ix2>,
                      Array<f64, Ix1>)
{
  use nd::{arr1, arr2};

  (arr1(&[0.0, 0.0, 0.0]),
   arr1(&[0.0, 0.0]),
   arr2(&[
     [1.0, -1.0, 1.0, -1.0],
     [1.0, 1.0, -1.0, -1.0],
     [0.0, 1.0, 0.0, -1.0],
   ]),
   arr2(&[
     [1.0, -1.0, 1.0, -1.0],
     [0.0, 1.0, -1.0, 0.0],
   ]),
   arr1(&[1.0, 1.0]))
}

#[cfg(test)]
fn wide_window() -> (Array<f64, Ix1>, Array<f64, Ix1>,
                     Array<f64, Ix2>, Array<f64, Ix2>,
                     Array<f64, Ix1>)
{
  use nd::{arr1, arr2};

  (arr1(&[1.0, -2.0]),
   arr1(&[0.5, 0.0, -0.5, 1.0, 0.25]),
   arr2(&[
     [0.6, -0.3, -0.3],
     [-0.2, 0.5, -0.3],
   ]),
   arr2(&[
     [0.4, -0.1, -0.3],
     [-0.2, 0.3, -0.1],
     [0.1, 0.1, -0.2],
     [0.5, -0.4, -0.1],
     [-0.3, 0.2, 0.1],
   ]),
   arr1(&[0.25, 0.25, 0.5, 0.5, 1.0]))
}

#[cfg(test)]
fn factor(mean_x: &Array<f64, Ix1>, mean_y: &Array<f64, Ix1>,
          x: &Array<f64, Ix2>, y: &Array<f64, Ix2>,
          r: &Array<f64, Ix1>, xnorm: f64)
          -> Factorization<f64>
{
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: xnorm,
  };
  Factorization::compute(&init).expect("factorization failed")
}

#[test]
fn rank_counts_informative_directions() {
  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  assert_eq!(f.rank(), 2);
  let w = f.singular_values();
  assert!(w[0] >= w[1]);
  assert!(w[1] > 0.0);
}

#[test]
fn left_vectors_orthonormal() {
  use utils::PartialEqWithinTol;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let (u_r, _) = f.u.view().split_at(Axis(1), f.n_wy);
  for i in 0..f.n_wy {
    for j in 0..f.n_wy {
      let d = u_r.column(i).dot(&u_r.column(j));
      let expected = if i == j { 1.0 } else { 0.0 };
      assert!(d.partial_eq_within_tol(&expected, 1.0e-12),
              "uᵗu[{}, {}] = {}", i, j, d);
    }
  }
}

#[test]
fn deflation_factors_bounded() {
  let (mean_x, mean_y, x, y, r) = wide_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 2.0);

  assert!(f.rank() <= 3);
  for (i, md) in f.md.iter().enumerate() {
    assert!(*md > 0.0 && *md <= 1.0, "md[{}] = {}", i, md);
    if f.w[i] == 0.0 {
      assert_eq!(*md, 1.0);
    }
  }
}

#[test]
fn zero_innovation_is_exact() {
  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let inc = f.increment(f.mean_y()).expect("increment failed");
  assert!(inc.iter().all(|&v| v == 0.0));

  let post = f.posterior(mean_y.view()).expect("posterior failed");
  assert_eq!(post, mean_x);
  assert_eq!(post.view(), f.mean_x());
}

#[test]
fn increment_is_deterministic() {
  use nd::arr1;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let yobs = arr1(&[0.3, -0.7]);
  let a = f.increment(yobs.view()).expect("increment failed");
  let b = f.increment(yobs.view()).expect("increment failed");
  assert_eq!(a, b);
}

#[test]
fn transform_symmetric_contracting() {
  use linxal::eigenvalues::general::Eigen;
  use utils::PartialEqWithinTol;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let tm = f.transform_matrix();
  assert_eq!(tm.dim(), (4, 4));
  for i in 0..4 {
    for j in 0..4 {
      assert!(tm[[i, j]].partial_eq_within_tol(&tm[[j, i]], 1.0e-12),
              "tm not symmetric at [{}, {}]", i, j);
    }
  }

  let sol = Eigen::compute_into(tm, false, false)
    .expect("can't eigendecomp transform");
  for v in sol.values.iter() {
    assert!(v.im.abs() < 1.0e-12);
    assert!(v.re > 0.0, "eigenvalue {} not positive", v.re);
    assert!(v.re <= 1.0 + 1.0e-12, "eigenvalue {} above one", v.re);
  }
}

#[test]
fn transform_identity_off_observed_subspace() {
  use utils::PartialEqWithinTol;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);
  let tm = f.transform_matrix();

  // Strip the observed directions from a probe vector; what is left
  // must pass through the transform unchanged.
  let mut z: Array<f64, Ix1> = ArrayBase::zeros(4);
  z[0] = 1.0;
  z[3] = -2.0;
  let (u_r, _) = f.u.view().split_at(Axis(1), f.n_wy);
  for j in 0..f.n_wy {
    let proj = u_r.column(j).dot(&z);
    for i in 0..4 {
      z[i] -= proj * u_r.column(j)[i];
    }
  }

  let tz = tm.dot(&z);
  assert!(tz.view().partial_eq_within_tol(&z.view(), 1.0e-12));
}

#[test]
fn wide_window_rank_bounded() {
  let (mean_x, mean_y, x, y, r) = wide_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 2.0);

  assert_eq!(f.observation_count(), 5);
  assert_eq!(f.ensemble_count(), 3);
  assert_eq!(f.state_size(), 2);
  assert!(f.rank() <= 3);
  assert_eq!(f.scaled_ensemble().dim(), (2, 3));
  assert_eq!(f.scaled_observation_ensemble().dim(), (5, 3));

  let post = f.posterior(mean_y.view()).expect("posterior failed");
  assert_eq!(post, mean_x);
}

#[test]
fn gain_consistent_with_increment() {
  use nd::arr1;
  use utils::PartialEqWithinTol;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let yobs = arr1(&[0.3, -0.2]);
  let inc = f.increment(yobs.view()).expect("increment failed");
  let via_increment = f.scaled_ensemble().dot(&inc);

  let k = f.gain_matrix();
  assert_eq!(k.dim(), (3, 2));
  let dy0 = &yobs - &mean_y;
  let via_gain = k.dot(&dy0);

  assert!(via_gain.view()
          .partial_eq_within_tol(&via_increment.view(), 1.0e-12));
}

#[test]
fn posterior_linear_in_innovation() {
  use nd::arr1;
  use utils::PartialEqWithinTol;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let eps = 1.0e-6;
  let y1 = arr1(&[eps, 0.0]);
  let y2 = arr1(&[2.0 * eps, 0.0]);

  let d1 = f.posterior(y1.view()).expect("posterior failed") - &mean_x;
  let d2 = f.posterior(y2.view()).expect("posterior failed") - &mean_x;

  let twice = d1.mapv(|v| 2.0 * v);
  assert!(d2.view().partial_eq_within_tol(&twice.view(), 1.0e-14));

  let norm1: f64 = d1.iter().map(|v| v * v).sum::<f64>().sqrt();
  assert!(norm1 < 10.0 * eps, "posterior jumps at zero innovation");
}

#[test]
fn aux_projection_matches_primary() {
  use nd::arr1;
  use utils::PartialEqWithinTol;

  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let yobs = arr1(&[0.5, 0.25]);
  let inc = f.increment(yobs.view()).expect("increment failed");

  // Feeding the primary ensemble back through the auxiliary path
  // must reproduce the posterior shift.
  let aux = f.aux_increment(x.view(), None, inc.view())
    .expect("aux increment failed");
  let post = f.posterior(yobs.view()).expect("posterior failed");
  let shift = post - &mean_x;
  assert!(aux.view().partial_eq_within_tol(&shift.view(), 1.0e-12));

  // Centering inside the call is equivalent to centering outside.
  let offset = arr1(&[2.0, -1.0, 0.5]);
  let mut raw = x.clone();
  for ((i, _), v) in raw.indexed_iter_mut() {
    *v = *v + offset[i];
  }
  let aux2 = f.aux_increment(raw.view(), Some(offset.view()), inc.view())
    .expect("aux increment failed");
  assert!(aux2.view().partial_eq_within_tol(&aux.view(), 1.0e-12));

  let aux_obs = f.aux_observation_increment(y.view(), inc.view(), None)
    .expect("aux observation increment failed");
  assert_eq!(aux_obs.dim(), 2);
}

#[test]
fn apply_transform_contracts_observed_ensemble() {
  let (mean_x, mean_y, x, y, r) = small_window();
  let f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);
  let tm = f.transform_matrix();

  let yt = f.apply_transform(y.view(), &tm, None)
    .expect("transform application failed");
  assert_eq!(yt.dim(), y.dim());

  let frob = |a: &Array<f64, Ix2>| -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
  };
  assert!(frob(&yt) <= frob(&y) + 1.0e-12);
}

#[test]
fn reset_failure_keeps_previous_analysis() {
  use std::f64::NAN;
  use nd::arr1;

  let (mean_x, mean_y, x, y, r) = small_window();
  let mut f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);

  let yobs = arr1(&[0.3, -0.2]);
  let post_before = f.posterior(yobs.view()).expect("posterior failed");
  let tm_before = f.transform_matrix();

  let mut bad_y = y.clone();
  bad_y[[0, 0]] = NAN;
  let bad = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: bad_y.view(),
    r: r.view(),
    xnorm: 3.0,
  };
  match f.reset(&bad) {
    Err(Error::NonFinite { what }) => assert_eq!(what, "y"),
    other => panic!("expected non-finite error, got {:?}", other),
  }

  let post_after = f.posterior(yobs.view()).expect("posterior failed");
  assert_eq!(post_before, post_after);
  assert_eq!(tm_before, f.transform_matrix());
}

#[test]
fn reset_replaces_state_on_success() {
  let (mean_x, mean_y, x, y, r) = small_window();
  let mut f = factor(&mean_x, &mean_y, &x, &y, &r, 3.0);
  assert_eq!(f.observation_count(), 2);

  let (mean_x2, mean_y2, x2, y2, r2) = wide_window();
  let next = EnsembleInit {
    mean_x: mean_x2.view(),
    mean_y: mean_y2.view(),
    x: x2.view(),
    y: y2.view(),
    r: r2.view(),
    xnorm: 2.0,
  };
  f.reset(&next).expect("reset failed");

  assert_eq!(f.observation_count(), 5);
  assert_eq!(f.ensemble_count(), 3);
  let post = f.posterior(mean_y2.view()).expect("posterior failed");
  assert_eq!(post, mean_x2);
}
