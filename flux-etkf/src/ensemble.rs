
//! Input contract for one assimilation window.

use linxal::types::LinxalImplScalar;

use nd::{ArrayBase, ArrayView, Data, Dimension, Ix1, Ix2};

use num_traits::{Float, Zero};

use error::{Error, Result};

/// One window's inputs; perturbation columns are never re-centered.
#[derive(Debug, Clone)]
pub struct EnsembleInit<'a, E>
  where E: LinxalImplScalar,
{
  pub mean_x: ArrayView<'a, E, Ix1>,
  pub mean_y: ArrayView<'a, E, Ix1>,
  pub x: ArrayView<'a, E, Ix2>,
  pub y: ArrayView<'a, E, Ix2>,
  /// Diagonal observation-error variances, strictly positive.
  pub r: ArrayView<'a, E, Ix1>,
  /// Classically the ensemble size minus one.
  pub xnorm: E,
}

impl<'a, E> EnsembleInit<'a, E>
  where E: LinxalImplScalar + Float,
{
  pub fn state_size(&self) -> usize { self.x.dim().0 }
  pub fn ensemble_count(&self) -> usize { self.x.dim().1 }
  pub fn observation_count(&self) -> usize { self.y.dim().0 }

  /// Non-finite input fails here, not in the decomposition.
  pub fn validate(&self) -> Result<()> {
    let (nx, ne) = self.x.dim();
    let (ny, ne_y) = self.y.dim();

    if self.mean_x.dim() != nx {
      return Err(Error::Shape {
        what: "mean_x",
        expected: nx,
        found: self.mean_x.dim(),
      });
    }
    if self.mean_y.dim() != ny {
      return Err(Error::Shape {
        what: "mean_y",
        expected: ny,
        found: self.mean_y.dim(),
      });
    }
    if ne_y != ne {
      return Err(Error::Shape {
        what: "y columns",
        expected: ne,
        found: ne_y,
      });
    }
    if self.r.dim() != ny {
      return Err(Error::Shape {
        what: "r",
        expected: ny,
        found: self.r.dim(),
      });
    }

    if !(self.xnorm > E::zero()) {
      return Err(Error::NonPositiveNorm);
    }
    if !self.xnorm.is_finite() {
      return Err(Error::NonFinite { what: "xnorm" });
    }
    for (i, v) in self.r.iter().enumerate() {
      if !(*v > E::zero()) {
        return Err(Error::NonPositiveVariance { index: i });
      }
    }

    check_finite("mean_x", &self.mean_x)?;
    check_finite("mean_y", &self.mean_y)?;
    check_finite("x", &self.x)?;
    check_finite("y", &self.y)?;
    check_finite("r", &self.r)?;

    Ok(())
  }
}

fn check_finite<E, S, D>(what: &'static str,
                         a: &ArrayBase<S, D>) -> Result<()>
  where E: LinxalImplScalar + Float,
        S: Data<Elem = E>,
        D: Dimension,
{
  if a.iter().all(|v| v.is_finite()) {
    Ok(())
  } else {
    Err(Error::NonFinite { what: what })
  }
}

#[cfg(test)]
fn wellformed() -> (::nd::Array<f64, Ix1>, ::nd::Array<f64, Ix1>,
                    ::nd::Array<f64, Ix2>, ::nd::Array<f64, Ix2>,
                    ::nd::Array<f64, Ix1>)
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

#[test]
fn validate_accepts_consistent_window() {
  let (mean_x, mean_y, x, y, r) = wellformed();
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: 3.0,
  };
  init.validate().expect("consistent window rejected");
}

#[test]
fn validate_rejects_mismatched_variances() {
  use nd::arr1;

  let (mean_x, mean_y, x, y, _) = wellformed();
  let r = arr1(&[1.0, 1.0, 1.0]);
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: 3.0,
  };
  match init.validate() {
    Err(Error::Shape { what, expected, found }) => {
      assert_eq!(what, "r");
      assert_eq!(expected, 2);
      assert_eq!(found, 3);
    },
    other => panic!("expected shape error, got {:?}", other),
  }
}

#[test]
fn validate_rejects_mismatched_members() {
  use nd::arr2;

  let (mean_x, mean_y, x, _, r) = wellformed();
  let y = arr2(&[
    [1.0, -1.0, 1.0],
    [0.0, 1.0, -1.0],
  ]);
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: 3.0,
  };
  match init.validate() {
    Err(Error::Shape { what, .. }) => assert_eq!(what, "y columns"),
    other => panic!("expected shape error, got {:?}", other),
  }
}

#[test]
fn validate_rejects_nonpositive_variance() {
  use nd::arr1;

  let (mean_x, mean_y, x, y, _) = wellformed();
  let r = arr1(&[1.0, 0.0]);
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: 3.0,
  };
  match init.validate() {
    Err(Error::NonPositiveVariance { index }) => assert_eq!(index, 1),
    other => panic!("expected variance error, got {:?}", other),
  }
}

#[test]
fn validate_rejects_nonpositive_norm() {
  let (mean_x, mean_y, x, y, r) = wellformed();
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: 0.0,
  };
  match init.validate() {
    Err(Error::NonPositiveNorm) => {},
    other => panic!("expected norm error, got {:?}", other),
  }
}

#[test]
fn validate_rejects_poisoned_ensemble() {
  use std::f64::NAN;

  let (mean_x, mean_y, mut x, y, r) = wellformed();
  x[[1, 2]] = NAN;
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: 3.0,
  };
  match init.validate() {
    Err(Error::NonFinite { what }) => assert_eq!(what, "x"),
    other => panic!("expected non-finite error, got {:?}", other),
  }
}
