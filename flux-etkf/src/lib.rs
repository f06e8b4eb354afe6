
//! Ensemble-transform analysis for satellite CO2 flux inversion.

extern crate ndarray as nd;
extern crate ndarray_parallel as nd_par;
extern crate rayon;
extern crate linxal;
extern crate num_traits;
extern crate rand;

pub use error::{Result, Error};

pub mod error;
pub mod ensemble;
pub mod etkf;
pub mod utils;
