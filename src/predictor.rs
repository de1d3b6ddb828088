//! The prediction function contract.

use crate::error::PredictionFailure;

/// A batch prediction function.
///
/// Implementations must return a result sequence of the same length and
/// order as the input batch, and must not be invoked concurrently by a
/// single [`crate::worker::Worker`] — the worker holds no locks across the
/// call, but it awaits one invocation to completion before starting the
/// next.
///
/// A blanket impl covers plain closures (`Fn(Vec<Req>) -> Result<Vec<Res>,
/// PredictionFailure> + Send + Sync`) for the common case; implement the
/// trait directly when the predictor needs to own state, such as a loaded
/// model handle.
pub trait Predictor: Send + Sync {
    type Request: Send;
    type Response: Send;

    fn predict(
        &self,
        batch: Vec<Self::Request>,
    ) -> Result<Vec<Self::Response>, PredictionFailure>;
}

impl<Req, Res, F> Predictor for F
where
    F: Fn(Vec<Req>) -> Result<Vec<Res>, PredictionFailure> + Send + Sync,
    Req: Send,
    Res: Send,
{
    type Request = Req;
    type Response = Res;

    fn predict(&self, batch: Vec<Req>) -> Result<Vec<Res>, PredictionFailure> {
        (self)(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_predictor_doubles_input() {
        let predictor = |batch: Vec<i32>| Ok(batch.into_iter().map(|x| x * 2).collect());
        let out = Predictor::predict(&predictor, vec![1, 2, 3]).unwrap();
        assert_eq!(out, vec![2, 4, 6]);
    }
}
