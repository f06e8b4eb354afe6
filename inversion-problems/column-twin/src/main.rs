
extern crate ndarray as nd;
extern crate flux_etkf;
extern crate rand;

use nd::{Array, ArrayView, Ix1, Ix2};

use rand::SeedableRng;
use rand::distributions::IndependentSample;

use flux_etkf::ensemble::EnsembleInit;
use flux_etkf::etkf::Factorization;
use flux_etkf::utils::sample_perturbations;

const NX: usize = 12;
const NE: usize = 24;
const NY: usize = 30;
const RNG_SEED: [u64; 1] = [1];
const OBS_SIGMA: f64 = 0.5;
const PRIOR_SPREAD: f64 = 0.8;

fn footprints() -> Array<f64, Ix2> {
  // Sounding k integrates the flux regions around its footprint
  // center.
  let mut h: Array<f64, Ix2> = Array::zeros((NY, NX));
  for k in 0..NY {
    let center = (k as f64) * (NX as f64) / (NY as f64);
    for i in 0..NX {
      let d = i as f64 - center;
      h[[k, i]] = (-d * d / 8.0).exp();
    }
    let total: f64 = h.row(k).iter().sum();
    h.row_mut(k).mapv_inplace(|v| v / total);
  }
  h
}

fn truth_fluxes() -> Array<f64, Ix1> {
  let mut t: Array<f64, Ix1> = Array::zeros(NX);
  for (i, dest) in t.indexed_iter_mut() {
    *dest = 1.0 + 0.5 * ((i as f64) * 0.7).sin();
  }
  t
}

fn rms(a: ArrayView<f64, Ix1>, b: ArrayView<f64, Ix1>) -> f64 {
  let mut sum = 0.0;
  for (l, r) in a.iter().zip(b.iter()) {
    sum += (l - r) * (l - r);
  }
  (sum / a.dim() as f64).sqrt()
}

fn main() {
  let mut rand = rand::Isaac64Rng::from_seed(&RNG_SEED[..]);
  let normal = rand::distributions::normal::Normal::new(0.0, 1.0);

  let h = footprints();
  let truth = truth_fluxes();

  // Prior: flat flux scaling, Gaussian perturbations.
  let mean_x: Array<f64, Ix1> = Array::from_elem(NX, 1.0);
  let spread: Array<f64, Ix1> = Array::from_elem(NX, PRIOR_SPREAD);
  let x = sample_perturbations((NX, NE), spread.view(), &mut rand);

  let mean_y = h.dot(&mean_x);
  let y = h.dot(&x);
  let r: Array<f64, Ix1> = Array::from_elem(NY, OBS_SIGMA * OBS_SIGMA);
  let xnorm = (NE - 1) as f64;

  let mut yobs = h.dot(&truth);
  for dest in yobs.iter_mut() {
    *dest += OBS_SIGMA * normal.ind_sample(&mut rand);
  }

  println!("Assimilating window 1 ({} soundings, {} members)", NY, NE);
  let init = EnsembleInit {
    mean_x: mean_x.view(),
    mean_y: mean_y.view(),
    x: x.view(),
    y: y.view(),
    r: r.view(),
    xnorm: xnorm,
  };
  let mut fact = Factorization::compute(&init)
    .expect("window 1 factorization failed");

  let post = fact.posterior(yobs.view()).expect("posterior failed");
  println!("  rank                = {}", fact.rank());
  println!("  prior rms error     = {:.4}",
           rms(mean_x.view(), truth.view()));
  println!("  posterior rms error = {:.4}",
           rms(post.view(), truth.view()));

  let inc = fact.increment(yobs.view()).expect("increment failed");
  let k = fact.gain_matrix();
  let dy0 = &yobs - &mean_y;
  let via_gain = k.dot(&dy0);
  let shift = &post - &mean_x;
  println!("  gain/increment drift = {:.3e}",
           rms(via_gain.view(), shift.view()));

  // Global-mean flux as a diagnostic quantity, updated through the
  // auxiliary projection without touching the factorization.
  let hs: Array<f64, Ix2> = Array::from_elem((1, NX), 1.0 / NX as f64);
  let y_aux = hs.dot(&x);
  let mean_aux = hs.dot(&mean_x);
  let aux_inc = fact.aux_observation_increment(y_aux.view(), inc.view(),
                                               None)
    .expect("aux projection failed");
  println!("  mean-flux update    = {:.4} -> {:.4} (direct {:.4})",
           mean_aux[0],
           mean_aux[0] + aux_inc[0],
           hs.dot(&post)[0]);

  // Posterior perturbations seed the next window.
  let tm = fact.transform_matrix();
  let x2 = fact.apply_transform(x.view(), &tm, None)
    .expect("transform application failed");

  let mean_x2 = post.clone();
  let mean_y2 = h.dot(&mean_x2);
  let y2 = h.dot(&x2);
  let mut yobs2 = h.dot(&truth);
  for dest in yobs2.iter_mut() {
    *dest += OBS_SIGMA * normal.ind_sample(&mut rand);
  }

  // A poisoned refactorization is refused; the window 1 analysis
  // stays live.
  let mut bad_y = y2.clone();
  bad_y[[0, 0]] = ::std::f64::NAN;
  {
    let bad = EnsembleInit {
      mean_x: mean_x2.view(),
      mean_y: mean_y2.view(),
      x: x2.view(),
      y: bad_y.view(),
      r: r.view(),
      xnorm: xnorm,
    };
    match fact.reset(&bad) {
      Err(e) => println!("Rejected poisoned window: {:?}", e),
      Ok(()) => panic!("poisoned window accepted"),
    }
  }
  let still = fact.posterior(yobs.view()).expect("posterior failed");
  println!("  window 1 analysis still served: {}", still == post);

  println!("Assimilating window 2");
  let init2 = EnsembleInit {
    mean_x: mean_x2.view(),
    mean_y: mean_y2.view(),
    x: x2.view(),
    y: y2.view(),
    r: r.view(),
    xnorm: xnorm,
  };
  fact.reset(&init2).expect("window 2 factorization failed");
  let post2 = fact.posterior(yobs2.view()).expect("posterior failed");
  println!("  posterior rms error = {:.4}",
           rms(post2.view(), truth.view()));
  println!("Twin experiment done");
}
