
use linxal::svd::types::SVDError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
  /// LAPACK failed to factor the whitened observation ensemble.
  Svd(SVDError),
  /// The factorization came back without the requested singular
  /// vectors.
  MissingSingularVectors,
  /// Two inputs disagree about a dimension.
  Shape {
    what: &'static str,
    expected: usize,
    found: usize,
  },
  /// Observation-error variances must be strictly positive.
  NonPositiveVariance {
    index: usize,
  },
  /// The ensemble normalizer must be strictly positive.
  NonPositiveNorm,
  /// NaN or infinity in an input array.
  NonFinite {
    what: &'static str,
  },
}

impl From<SVDError> for Error {
  fn from(v: SVDError) -> Error {
    Error::Svd(v)
  }
}
