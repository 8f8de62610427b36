//! Adam optimizer with bias correction.

use crate::network::{Gradients, LinearNet};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BETA_2: f32 = 0.999;
pub const DEFAULT_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    iterations: u64,
    /// First and second moments, one slot per parameter tensor.
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta_1: f32) -> Self {
        Self {
            learning_rate,
            beta_1,
            beta_2: DEFAULT_BETA_2,
            epsilon: DEFAULT_EPSILON,
            iterations: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Start a new step; updates in this step share one bias correction.
    pub fn begin_step(&mut self) {
        self.iterations += 1;
    }

    /// Update one parameter tensor in place. `slot` identifies the tensor
    /// across steps; moments are allocated on first use.
    pub fn update<'p, 'g>(
        &mut self,
        slot: usize,
        params: impl IntoIterator<Item = &'p mut f32>,
        grads: impl IntoIterator<Item = &'g f32>,
        len: usize,
    ) {
        if self.m.len() <= slot {
            self.m.resize(slot + 1, Vec::new());
            self.v.resize(slot + 1, Vec::new());
        }
        if self.m[slot].len() != len {
            self.m[slot] = vec![0.0; len];
            self.v[slot] = vec![0.0; len];
        }

        let t = self.iterations.max(1) as i32;
        let correction_1 = 1.0 - self.beta_1.powi(t);
        let correction_2 = 1.0 - self.beta_2.powi(t);
        let step = self.learning_rate * correction_2.sqrt() / correction_1;

        let (m, v) = (&mut self.m[slot], &mut self.v[slot]);
        for (((p, &g), m), v) in params.into_iter().zip(grads).zip(m.iter_mut()).zip(v.iter_mut()) {
            *m = self.beta_1 * *m + (1.0 - self.beta_1) * g;
            *v = self.beta_2 * *v + (1.0 - self.beta_2) * g * g;
            *p -= step * *m / (v.sqrt() + self.epsilon);
        }
    }

    /// One step over both tensors of a [`LinearNet`].
    pub fn apply(&mut self, net: &mut LinearNet, grads: &Gradients) {
        self.begin_step();
        let (weights, bias) = net.params_mut();
        let (nw, nb) = (weights.len(), bias.len());
        self.update(0, weights.iter_mut(), grads.weights.iter(), nw);
        self.update(1, bias.iter_mut(), grads.bias.iter(), nb);
    }
}
