//! Statistical face model (BFM) loaded from a NumPy `.npz` archive.
//!
//! Vertices are stored interleaved (`x0, y0, z0, x1, ...`). The model is
//! immutable after loading and is shared between threads behind an `Arc`.

use ndarray::{Array1, Array2, ArrayD, ArrayView1, Axis, Ix2};
use ndarray_npy::{NpzReader, ReadNpzError};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("face model file not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("npz: {0}")]
    Npz(#[from] ReadNpzError),
    #[error("face model is missing array `{0}`")]
    MissingArray(String),
    #[error("array `{name}` has unexpected shape {shape:?}: {reason}")]
    Shape {
        name: String,
        shape: Vec<usize>,
        reason: String,
    },
    #[error("landmark index {index} out of range for {vertices} vertices")]
    LandmarkIndex { index: usize, vertices: usize },
    #[error("got {actual} {kind} coefficients, model supports at most {max}")]
    CoefficientCount {
        kind: &'static str,
        actual: usize,
        max: usize,
    },
}

/// Raw arrays making up a face model, before validation.
#[derive(Debug, Clone)]
pub struct FaceModelParts {
    pub shape_mu: Array1<f32>,
    pub shape_pc: Array2<f32>,
    pub shape_ev: Array1<f32>,
    pub exp_pc: Array2<f32>,
    pub exp_ev: Option<Array1<f32>>,
    pub tex_ev: Array1<f32>,
    pub landmark_indices: Vec<usize>,
}

/// Validated, read-only 3D morphable model.
#[derive(Debug)]
pub struct FaceModel {
    shape_mu: Array1<f32>,
    shape_pc: Array2<f32>,
    shape_ev: Array1<f32>,
    exp_pc: Array2<f32>,
    exp_ev: Option<Array1<f32>>,
    tex_ev: Array1<f32>,
    landmark_indices: Vec<usize>,
    // Rows of the bases restricted to the landmark vertices.
    lm_mu: Array1<f32>,
    lm_shape_pc: Array2<f32>,
    lm_exp_pc: Array2<f32>,
}

impl FaceModel {
    /// Load a model from an `.npz` archive converted from `BFM.mat`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::NotFound(path.display().to_string()));
        }

        let mut npz = NpzReader::new(File::open(path)?)?;
        let names = npz.names()?;

        let shape_mu = read_vector(&mut npz, &names, "shapeMU")?;
        let shape_pc = read_matrix(&mut npz, &names, "shapePC")?;
        let shape_ev = read_vector(&mut npz, &names, "shapeEV")?;
        let exp_pc = read_matrix(&mut npz, &names, "expPC")?;
        let exp_ev = if resolve_name(&names, "expEV").is_some() {
            Some(read_vector(&mut npz, &names, "expEV")?)
        } else {
            None
        };
        let tex_ev = read_vector(&mut npz, &names, "texEV")?;
        let landmark_indices = read_indices(&mut npz, &names, "kpt_ind")?;

        let model = Self::from_parts(FaceModelParts {
            shape_mu,
            shape_pc,
            shape_ev,
            exp_pc,
            exp_ev,
            tex_ev,
            landmark_indices,
        })?;

        tracing::info!(
            path = %path.display(),
            vertices = model.num_vertices(),
            shape_dims = model.shape_dims(),
            exp_dims = model.exp_dims(),
            landmarks = model.landmark_indices.len(),
            "loaded face model"
        );

        Ok(model)
    }

    /// Validate raw arrays and precompute the landmark sub-bases.
    pub fn from_parts(parts: FaceModelParts) -> Result<Self, ModelError> {
        let FaceModelParts {
            shape_mu,
            shape_pc,
            shape_ev,
            exp_pc,
            exp_ev,
            tex_ev,
            landmark_indices,
        } = parts;

        let n3 = shape_mu.len();
        if n3 == 0 || n3 % 3 != 0 {
            return Err(shape_error("shapeMU", &[n3], "length must be a positive multiple of 3"));
        }
        if shape_pc.nrows() != n3 {
            return Err(shape_error("shapePC", shape_pc.shape(), "row count must match shapeMU"));
        }
        if shape_ev.len() != shape_pc.ncols() {
            return Err(shape_error("shapeEV", shape_ev.shape(), "length must match shapePC columns"));
        }
        if exp_pc.nrows() != n3 {
            return Err(shape_error("expPC", exp_pc.shape(), "row count must match shapeMU"));
        }
        if let Some(ev) = &exp_ev {
            if ev.len() != exp_pc.ncols() {
                return Err(shape_error("expEV", ev.shape(), "length must match expPC columns"));
            }
        }

        let vertices = n3 / 3;
        if let Some(&index) = landmark_indices.iter().find(|&&i| i >= vertices) {
            return Err(ModelError::LandmarkIndex { index, vertices });
        }

        let rows: Vec<usize> = landmark_indices
            .iter()
            .flat_map(|&i| [3 * i, 3 * i + 1, 3 * i + 2])
            .collect();
        let lm_mu = shape_mu.select(Axis(0), &rows);
        let lm_shape_pc = shape_pc.select(Axis(0), &rows);
        let lm_exp_pc = exp_pc.select(Axis(0), &rows);

        Ok(Self {
            shape_mu,
            shape_pc,
            shape_ev,
            exp_pc,
            exp_ev,
            tex_ev,
            landmark_indices,
            lm_mu,
            lm_shape_pc,
            lm_exp_pc,
        })
    }

    pub fn num_vertices(&self) -> usize {
        self.shape_mu.len() / 3
    }

    pub fn shape_dims(&self) -> usize {
        self.shape_pc.ncols()
    }

    pub fn exp_dims(&self) -> usize {
        self.exp_pc.ncols()
    }

    pub fn shape_ev(&self) -> ArrayView1<'_, f32> {
        self.shape_ev.view()
    }

    pub fn exp_ev(&self) -> Option<ArrayView1<'_, f32>> {
        self.exp_ev.as_ref().map(|ev| ev.view())
    }

    pub fn tex_ev(&self) -> ArrayView1<'_, f32> {
        self.tex_ev.view()
    }

    pub fn landmark_indices(&self) -> &[usize] {
        &self.landmark_indices
    }

    /// Landmark rows of the shape basis, (3 * landmarks, shape_dims).
    pub fn landmark_shape_basis(&self) -> &Array2<f32> {
        &self.lm_shape_pc
    }

    /// Landmark rows of the expression basis, (3 * landmarks, exp_dims).
    pub fn landmark_exp_basis(&self) -> &Array2<f32> {
        &self.lm_exp_pc
    }

    /// Full mesh vertices `mu + S·shape + E·exp`, returned as (n, 3).
    pub fn generate_vertices(&self, shape: &[f32], exp: &[f32]) -> Result<Array2<f32>, ModelError> {
        let flat = blend(&self.shape_mu, &self.shape_pc, &self.exp_pc, shape, exp)?;
        Ok(to_rows(flat))
    }

    /// Vertices of the landmark subset only, returned as (landmarks, 3).
    pub fn generate_landmark_vertices(
        &self,
        shape: &[f32],
        exp: &[f32],
    ) -> Result<Array2<f32>, ModelError> {
        let flat = blend(&self.lm_mu, &self.lm_shape_pc, &self.lm_exp_pc, shape, exp)?;
        Ok(to_rows(flat))
    }
}

fn blend(
    mu: &Array1<f32>,
    shape_pc: &Array2<f32>,
    exp_pc: &Array2<f32>,
    shape: &[f32],
    exp: &[f32],
) -> Result<Array1<f32>, ModelError> {
    check_count("shape", shape.len(), shape_pc.ncols())?;
    check_count("expression", exp.len(), exp_pc.ncols())?;

    let mut out = mu.clone();
    if !shape.is_empty() {
        let basis = shape_pc.slice(ndarray::s![.., ..shape.len()]);
        out += &basis.dot(&ArrayView1::from(shape));
    }
    if !exp.is_empty() {
        let basis = exp_pc.slice(ndarray::s![.., ..exp.len()]);
        out += &basis.dot(&ArrayView1::from(exp));
    }
    Ok(out)
}

fn check_count(kind: &'static str, actual: usize, max: usize) -> Result<(), ModelError> {
    if actual > max {
        return Err(ModelError::CoefficientCount { kind, actual, max });
    }
    Ok(())
}

fn to_rows(flat: Array1<f32>) -> Array2<f32> {
    let n = flat.len() / 3;
    Array2::from_shape_fn((n, 3), |(i, j)| flat[3 * i + j])
}

fn shape_error(name: &str, shape: &[usize], reason: &str) -> ModelError {
    ModelError::Shape {
        name: name.to_string(),
        shape: shape.to_vec(),
        reason: reason.to_string(),
    }
}

/// Find an archive entry by bare name, with or without the `.npy` suffix.
fn resolve_name<'a>(names: &'a [String], name: &str) -> Option<&'a str> {
    let suffixed = format!("{name}.npy");
    names
        .iter()
        .find(|n| n.as_str() == name || n.as_str() == suffixed)
        .map(|n| n.as_str())
}

/// Read a float array stored as either float32 or float64.
fn read_float(
    npz: &mut NpzReader<File>,
    names: &[String],
    name: &str,
) -> Result<ArrayD<f32>, ModelError> {
    let entry = resolve_name(names, name).ok_or_else(|| ModelError::MissingArray(name.to_string()))?;
    match npz.by_name::<ndarray::OwnedRepr<f32>, ndarray::IxDyn>(entry) {
        Ok(a) => Ok(a),
        Err(first) => match npz.by_name::<ndarray::OwnedRepr<f64>, ndarray::IxDyn>(entry) {
            Ok(a) => Ok(a.mapv(|v| v as f32)),
            Err(_) => Err(first.into()),
        },
    }
}

/// Read a 1-D vector; column and row vectors (`(n, 1)`, `(1, n)`) are flattened.
fn read_vector(
    npz: &mut NpzReader<File>,
    names: &[String],
    name: &str,
) -> Result<Array1<f32>, ModelError> {
    let a = read_float(npz, names, name)?;
    let shape = a.shape().to_vec();
    let non_singleton = shape.iter().filter(|&&d| d != 1).count();
    if non_singleton > 1 {
        return Err(shape_error(name, &shape, "expected a vector"));
    }
    Ok(a.iter().copied().collect())
}

fn read_matrix(
    npz: &mut NpzReader<File>,
    names: &[String],
    name: &str,
) -> Result<Array2<f32>, ModelError> {
    let a = read_float(npz, names, name)?;
    let shape = a.shape().to_vec();
    a.into_dimensionality::<Ix2>()
        .map_err(|e| shape_error(name, &shape, &e.to_string()))
}

fn read_indices(
    npz: &mut NpzReader<File>,
    names: &[String],
    name: &str,
) -> Result<Vec<usize>, ModelError> {
    let entry = resolve_name(names, name).ok_or_else(|| ModelError::MissingArray(name.to_string()))?;
    let values: Vec<i64> = if let Ok(a) = npz.by_name::<ndarray::OwnedRepr<i64>, ndarray::IxDyn>(entry) {
        a.iter().copied().collect()
    } else if let Ok(a) = npz.by_name::<ndarray::OwnedRepr<i32>, ndarray::IxDyn>(entry) {
        a.iter().map(|&v| v as i64).collect()
    } else {
        read_float(npz, names, name)?
            .iter()
            .map(|&v| v.round() as i64)
            .collect()
    };

    values
        .into_iter()
        .map(|v| {
            usize::try_from(v).map_err(|_| shape_error(name, &[], "landmark indices must be non-negative"))
        })
        .collect()
}
