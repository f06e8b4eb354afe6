
//! Shared numeric helpers.

use linxal::types::LinxalImplScalar;

use nd::{Array, ArrayBase, ArrayView, Ix1, Ix2};

use num_traits::{NumCast, One, Zero};

use rand::Rng;
use rand::distributions::IndependentSample;
use rand::distributions::normal::Normal;

use std::ops::MulAssign;

pub trait PartialEqWithinTol<Rhs, Tol> {
  fn partial_eq_within_tol(&self, rhs: &Rhs, tol: Tol) -> bool;
}

impl PartialEqWithinTol<f64, f64> for f64 {
  fn partial_eq_within_tol(&self, rhs: &f64, tol: f64) -> bool {
    (self - rhs).mag() <= tol
  }
}
impl PartialEqWithinTol<f32, f32> for f32 {
  fn partial_eq_within_tol(&self, rhs: &f32, tol: f32) -> bool {
    (self - rhs).mag() <= tol
  }
}

impl<'a, 'b, T> PartialEqWithinTol<ArrayView<'b, T, Ix1>, T> for ArrayView<'a, T, Ix1>
  where T: PartialEqWithinTol<T, T> + LinxalImplScalar,
{
  fn partial_eq_within_tol(&self, rhs: &ArrayView<'b, T, Ix1>, tol: T) -> bool {
    self.dim() == rhs.dim() &&
      self.iter()
        .zip(rhs.iter())
        .all(|(l, r)| l.partial_eq_within_tol(r, tol))
  }
}

/// Mean-zero Gaussian perturbations, row `i` scaled by `spread[i]`.
pub fn sample_perturbations<E, R>(dim: (usize, usize),
                                  spread: ArrayView<E, Ix1>,
                                  mut rand: &mut R) -> Array<E, Ix2>
  where E: LinxalImplScalar + MulAssign<E> + Zero + One + NumCast,
        R: Rng,
{
  assert_eq!(dim.0, spread.dim());

  let normal = Normal::new(0.0, 1.0);
  let mut r: Array<E, Ix2> = ArrayBase::zeros(dim);
  for i in 0..dim.0 {
    for j in 0..dim.1 {
      r[[i, j]] = NumCast::from(normal.ind_sample(&mut rand))
        .unwrap();
      r[[i, j]] *= spread[i];
    }
  }

  r
}

#[test]
fn perturbations_respect_spread() {
  use nd::arr1;
  use rand::SeedableRng;

  let mut rand = ::rand::Isaac64Rng::from_seed(&[17][..]);
  let spread = arr1(&[1.0, 0.0, 2.0]);
  let p: Array<f64, Ix2> = sample_perturbations((3, 16),
                                                spread.view(),
                                                &mut rand);

  assert_eq!(p.dim(), (3, 16));
  assert!(p.row(1).iter().all(|&v| v == 0.0));
  assert!(p.row(0).iter().any(|&v| v != 0.0));
}

#[test]
fn perturbations_deterministic_for_seed() {
  use nd::arr1;
  use rand::SeedableRng;

  let spread = arr1(&[0.5, 1.5]);
  let mut r1 = ::rand::Isaac64Rng::from_seed(&[3][..]);
  let mut r2 = ::rand::Isaac64Rng::from_seed(&[3][..]);
  let a: Array<f64, Ix2> = sample_perturbations((2, 8), spread.view(),
                                                &mut r1);
  let b: Array<f64, Ix2> = sample_perturbations((2, 8), spread.view(),
                                                &mut r2);
  assert_eq!(a, b);
}
