//! Linear regressor from image features to predicted coefficient blocks.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Half-width of the uniform weight initialization.
const INIT_RANGE: f32 = 0.01;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("input has {actual} features, network expects {expected}")]
    InputWidth { expected: usize, actual: usize },
    #[error("output gradient has shape {actual:?}, expected {expected:?}")]
    GradientShape {
        expected: [usize; 2],
        actual: [usize; 2],
    },
    #[error("stored weights hold {actual} values, expected {expected}")]
    StateSize { expected: usize, actual: usize },
}

/// `y = W x + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearNet {
    /// (outputs, inputs)
    weights: Array2<f32>,
    bias: Array1<f32>,
}

/// Parameter gradients from [`LinearNet::backward`].
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Serializable network parameters, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetState {
    pub inputs: usize,
    pub outputs: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LinearNet {
    /// Small seeded uniform weights, zero bias.
    pub fn new(inputs: usize, outputs: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::from_shape_fn((outputs, inputs), |_| rng.gen_range(-INIT_RANGE..INIT_RANGE));
        Self {
            weights,
            bias: Array1::zeros(outputs),
        }
    }

    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn outputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    /// Mutable parameter access for the optimizer: (weights, bias).
    pub fn params_mut(&mut self) -> (&mut Array2<f32>, &mut Array1<f32>) {
        (&mut self.weights, &mut self.bias)
    }

    /// `(batch, inputs) -> (batch, outputs)`.
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, NetworkError> {
        self.check_input(x)?;
        Ok(x.dot(&self.weights.t()) + &self.bias)
    }

    /// Parameter gradients given the inputs and dLoss/dOutput.
    pub fn backward(&self, x: ArrayView2<'_, f32>, dy: ArrayView2<'_, f32>) -> Result<Gradients, NetworkError> {
        self.check_input(x)?;
        let expected = [x.nrows(), self.outputs()];
        if dy.dim() != (expected[0], expected[1]) {
            return Err(NetworkError::GradientShape {
                expected,
                actual: [dy.nrows(), dy.ncols()],
            });
        }
        Ok(Gradients {
            weights: dy.t().dot(&x),
            bias: dy.sum_axis(Axis(0)),
        })
    }

    fn check_input(&self, x: ArrayView2<'_, f32>) -> Result<(), NetworkError> {
        if x.ncols() != self.inputs() {
            return Err(NetworkError::InputWidth {
                expected: self.inputs(),
                actual: x.ncols(),
            });
        }
        Ok(())
    }

    pub fn state(&self) -> NetState {
        NetState {
            inputs: self.inputs(),
            outputs: self.outputs(),
            weights: self.weights.iter().copied().collect(),
            bias: self.bias.to_vec(),
        }
    }

    pub fn from_state(state: NetState) -> Result<Self, NetworkError> {
        let expected = state.inputs * state.outputs;
        if state.weights.len() != expected {
            return Err(NetworkError::StateSize {
                expected,
                actual: state.weights.len(),
            });
        }
        if state.bias.len() != state.outputs {
            return Err(NetworkError::StateSize {
                expected: state.outputs,
                actual: state.bias.len(),
            });
        }
        let weights = Array2::from_shape_vec((state.outputs, state.inputs), state.weights).map_err(|_| {
            NetworkError::StateSize {
                expected,
                actual: 0,
            }
        })?;
        Ok(Self {
            weights,
            bias: Array1::from(state.bias),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_init_is_seeded_and_small() {
        let a = LinearNet::new(6, 4, 11);
        let b = LinearNet::new(6, 4, 11);
        assert_eq!(a, b);
        assert!(a.weights().iter().all(|w| w.abs() <= INIT_RANGE));
        assert!(a.bias().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_forward_matches_manual() {
        let net = LinearNet::from_state(NetState {
            inputs: 2,
            outputs: 2,
            weights: vec![1.0, 2.0, 3.0, 4.0],
            bias: vec![0.5, -0.5],
        })
        .unwrap();
        let y = net.forward(array![[1.0, 1.0], [2.0, 0.0]].view()).unwrap();
        assert_eq!(y, array![[3.5, 6.5], [2.5, 5.5]]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let net = LinearNet::new(3, 2, 1);
        let x = array![[0.5, -1.0, 0.25], [1.0, 0.0, -0.5]];
        // Loss = sum(y * c) for fixed c, so dy = c.
        let c = array![[1.0, -2.0], [0.5, 3.0]];
        let g = net.backward(x.view(), c.view()).unwrap();

        let loss = |n: &LinearNet| (n.forward(x.view()).unwrap() * &c).sum();
        let eps = 1e-2;
        let mut bumped = net.clone();
        bumped.params_mut().0[[1, 2]] += eps;
        let fd = (loss(&bumped) - loss(&net)) / eps;
        assert!((fd - g.weights[[1, 2]]).abs() < 1e-3);
        assert!((g.bias[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_shape_errors() {
        let net = LinearNet::new(3, 2, 0);
        let x = Array2::<f32>::zeros((1, 4));
        assert!(matches!(net.forward(x.view()), Err(NetworkError::InputWidth { expected: 3, actual: 4 })));
        let x = Array2::<f32>::zeros((1, 3));
        let dy = Array2::<f32>::zeros((2, 2));
        assert!(matches!(net.backward(x.view(), dy.view()), Err(NetworkError::GradientShape { .. })));
    }

    #[test]
    fn test_state_round_trip() {
        let net = LinearNet::new(5, 3, 2);
        let back = LinearNet::from_state(net.state()).unwrap();
        assert_eq!(net, back);
    }
}
