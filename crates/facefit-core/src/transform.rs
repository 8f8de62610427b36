//! Rigid transforms and camera projection for model vertices.
//!
//! Rotations follow the 3DDFA convention: `R = Rx(pitch) · Ry(yaw) · Rz(roll)`
//! applied to row vectors as `v · Rᵀ`.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

pub type Mat3 = [[f32; 3]; 3];

fn matmul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0f32; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn rx(x: f32) -> (Mat3, Mat3) {
    let (s, c) = x.sin_cos();
    (
        [[1.0, 0.0, 0.0], [0.0, c, s], [0.0, -s, c]],
        [[0.0, 0.0, 0.0], [0.0, -s, c], [0.0, -c, -s]],
    )
}

fn ry(y: f32) -> (Mat3, Mat3) {
    let (s, c) = y.sin_cos();
    (
        [[c, 0.0, -s], [0.0, 1.0, 0.0], [s, 0.0, c]],
        [[-s, 0.0, -c], [0.0, 0.0, 0.0], [c, 0.0, -s]],
    )
}

fn rz(z: f32) -> (Mat3, Mat3) {
    let (s, c) = z.sin_cos();
    (
        [[c, s, 0.0], [-s, c, 0.0], [0.0, 0.0, 1.0]],
        [[-s, c, 0.0], [-c, -s, 0.0], [0.0, 0.0, 0.0]],
    )
}

/// Rotation matrix from `[pitch, yaw, roll]` in radians.
pub fn angle_to_matrix_3ddfa(angles: [f32; 3]) -> Mat3 {
    let (x, _) = rx(angles[0]);
    let (y, _) = ry(angles[1]);
    let (z, _) = rz(angles[2]);
    matmul(&matmul(&x, &y), &z)
}

/// Partial derivatives of [`angle_to_matrix_3ddfa`] w.r.t. pitch, yaw and roll.
pub fn angle_to_matrix_3ddfa_grad(angles: [f32; 3]) -> [Mat3; 3] {
    let (x, dx) = rx(angles[0]);
    let (y, dy) = ry(angles[1]);
    let (z, dz) = rz(angles[2]);
    [
        matmul(&matmul(&dx, &y), &z),
        matmul(&matmul(&x, &dy), &z),
        matmul(&matmul(&x, &y), &dz),
    ]
}

/// Apply `R` to a single point.
pub fn rotate(r: &Mat3, v: [f32; 3]) -> [f32; 3] {
    [
        r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
        r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
        r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
    ]
}

/// Apply `Rᵀ` to a single point.
pub fn rotate_transposed(r: &Mat3, v: [f32; 3]) -> [f32; 3] {
    [
        r[0][0] * v[0] + r[1][0] * v[1] + r[2][0] * v[2],
        r[0][1] * v[0] + r[1][1] * v[1] + r[2][1] * v[2],
        r[0][2] * v[0] + r[1][2] * v[1] + r[2][2] * v[2],
    ]
}

/// `s · v · Rᵀ + t` for every row of an (n, 3) vertex array.
pub fn similarity_transform(vertices: ArrayView2<'_, f32>, s: f32, r: &Mat3, t: [f32; 3]) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((vertices.nrows(), 3));
    for (i, v) in vertices.outer_iter().enumerate() {
        let p = rotate(r, [v[0], v[1], v[2]]);
        for j in 0..3 {
            out[[i, j]] = s * p[j] + t[j];
        }
    }
    out
}

/// Camera model used to bring transformed vertices into image space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Projection {
    /// Scaled orthographic projection; the pose already carries
    /// image-space translation, so only the y axis is flipped.
    Orthographic,
    /// Pinhole frustum projection followed by the centered image mapping.
    Perspective { fovy_deg: f32, near: f32, far: f32 },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Orthographic
    }
}

impl Projection {
    /// Project camera-space vertices (n, 3) to image coordinates (n, 3).
    ///
    /// The third column keeps depth (larger = closer for perspective).
    pub fn project(&self, vertices: ArrayView2<'_, f32>, h: f32, w: f32) -> Array2<f32> {
        match *self {
            Projection::Orthographic => to_image(vertices, h, w, false),
            Projection::Perspective { fovy_deg, near, far } => {
                let ndc = perspective_project(vertices, fovy_deg, w / h, near, far);
                to_image(ndc.view(), h, w, true)
            }
        }
    }
}

/// Frustum projection to normalized device coordinates.
pub fn perspective_project(
    vertices: ArrayView2<'_, f32>,
    fovy_deg: f32,
    aspect_ratio: f32,
    near: f32,
    far: f32,
) -> Array2<f32> {
    let top = near * fovy_deg.to_radians().tan();
    let right = top * aspect_ratio;
    let p22 = -(far + near) / (far - near);
    let p23 = -2.0 * far * near / (far - near);

    let mut out = Array2::<f32>::zeros((vertices.nrows(), 3));
    for (i, v) in vertices.outer_iter().enumerate() {
        let x = near / right * v[0];
        let y = near / top * v[1];
        let z = p22 * v[2] + p23;
        let wh = -v[2];
        // Points on the camera plane project to infinity; keep them finite.
        let wh = if wh.abs() < f32::EPSILON { f32::EPSILON } else { wh };
        out[[i, 0]] = x / wh;
        out[[i, 1]] = y / wh;
        out[[i, 2]] = -(z / wh);
    }
    out
}

/// Map projected vertices to pixel coordinates with the origin at the top left.
///
/// Perspective input is in normalized device coordinates and is scaled and
/// centered first. The y axis is flipped as `h - y - 1`.
pub fn to_image(vertices: ArrayView2<'_, f32>, h: f32, w: f32, perspective: bool) -> Array2<f32> {
    let mut out = vertices.to_owned();
    for mut row in out.outer_iter_mut() {
        if perspective {
            row[0] = row[0] * w / 2.0 + w / 2.0;
            row[1] = row[1] * h / 2.0 + h / 2.0;
        }
        row[1] = h - row[1] - 1.0;
    }
    out
}
