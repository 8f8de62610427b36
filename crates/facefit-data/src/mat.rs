//! MATLAB level-5 label files via the `matfile` crate.
//!
//! Only numeric arrays are read; every numeric class is widened or narrowed
//! to `f32`. MATLAB stores data column-major, so accessors convert to the
//! row-major layout the rest of the pipeline uses.

use ndarray::Array2;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatError {
    #[error("label file not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("mat parse: {0}")]
    Parse(String),
    #[error("field `{0}` missing from label file")]
    MissingField(String),
    #[error("field `{name}` has {actual} values, expected at least {expected}")]
    FieldSize {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// One numeric array from a `.mat` file, data kept column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct MatArray {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl MatArray {
    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Row-major 2-D view of the array.
    pub fn to_matrix(&self) -> Array2<f32> {
        let (r, c) = (self.rows(), self.cols());
        Array2::from_shape_fn((r, c), |(i, j)| self.data[j * r + i])
    }
}

/// All numeric arrays of a label file, by name.
#[derive(Debug, Clone, Default)]
pub struct LabelMat {
    fields: HashMap<String, MatArray>,
}

impl LabelMat {
    pub fn from_fields(fields: HashMap<String, MatArray>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Result<&MatArray, MatError> {
        self.fields
            .get(name)
            .ok_or_else(|| MatError::MissingField(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Flat values of a vector-shaped field (`(n, 1)` or `(1, n)`), truncated
    /// to `take` entries when given.
    pub fn vector(&self, name: &str, take: Option<usize>) -> Result<Vec<f32>, MatError> {
        let array = self.get(name)?;
        let data = &array.data;
        match take {
            Some(n) if data.len() < n => Err(MatError::FieldSize {
                name: name.to_string(),
                expected: n,
                actual: data.len(),
            }),
            Some(n) => Ok(data[..n].to_vec()),
            None => Ok(data.clone()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }
}

/// Parse a `.mat` label file.
pub fn read_label_mat(path: impl AsRef<Path>) -> Result<LabelMat, MatError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MatError::NotFound(path.display().to_string()));
    }

    let reader = BufReader::new(File::open(path)?);
    let mat = matfile::MatFile::parse(reader).map_err(|e| MatError::Parse(format!("{}: {e:?}", path.display())))?;

    let fields = mat
        .arrays()
        .iter()
        .map(|a| {
            (
                a.name().to_string(),
                MatArray {
                    dims: a.size().to_vec(),
                    data: numeric_to_f32(a.data()),
                },
            )
        })
        .collect();

    Ok(LabelMat { fields })
}

fn numeric_to_f32(data: &matfile::NumericData) -> Vec<f32> {
    use matfile::NumericData as N;
    match data {
        N::Double { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::Single { real, .. } => real.clone(),
        N::Int8 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::UInt8 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::Int16 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::UInt16 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::Int32 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::UInt32 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::Int64 { real, .. } => real.iter().map(|&v| v as f32).collect(),
        N::UInt64 { real, .. } => real.iter().map(|&v| v as f32).collect(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Write an uncompressed level-5 `.mat` file with double arrays.
    /// `data` is column-major, as MATLAB stores it.
    pub(crate) fn write_test_mat(path: &Path, arrays: &[(&str, usize, usize, Vec<f64>)]) {
        let mut out = Vec::new();
        let mut header = [b' '; 116];
        let text = b"MATLAB 5.0 MAT-file, facefit test fixture";
        header[..text.len()].copy_from_slice(text);
        out.extend_from_slice(&header);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&0x0100u16.to_le_bytes());
        out.extend_from_slice(b"IM");

        for (name, rows, cols, data) in arrays {
            let mut body = Vec::new();
            // Array flags: mxDOUBLE_CLASS.
            element(&mut body, 6, &{
                let mut f = Vec::new();
                f.extend_from_slice(&6u32.to_le_bytes());
                f.extend_from_slice(&0u32.to_le_bytes());
                f
            });
            // Dimensions.
            element(&mut body, 5, &{
                let mut d = Vec::new();
                d.extend_from_slice(&(*rows as i32).to_le_bytes());
                d.extend_from_slice(&(*cols as i32).to_le_bytes());
                d
            });
            element(&mut body, 1, name.as_bytes());
            let mut real = Vec::new();
            for v in data {
                real.extend_from_slice(&v.to_le_bytes());
            }
            element(&mut body, 9, &real);
            element(&mut out, 14, &body);
        }

        let mut f = File::create(path).unwrap();
        f.write_all(&out).unwrap();
    }

    fn element(out: &mut Vec<u8>, data_type: u32, payload: &[u8]) {
        out.extend_from_slice(&data_type.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        let pad = (8 - payload.len() % 8) % 8;
        out.extend(std::iter::repeat(0u8).take(pad));
    }

    #[test]
    fn test_read_roundtrip_column_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.mat");
        // 2x3 matrix [[1, 2, 3], [4, 5, 6]] stored column-major.
        write_test_mat(
            &path,
            &[
                ("pt2d", 2, 3, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]),
                ("Pose_Para", 1, 7, vec![0.1, 0.2, 0.3, 4.0, 5.0, 6.0, 0.001]),
            ],
        );

        let mat = read_label_mat(&path).unwrap();
        let pt = mat.get("pt2d").unwrap();
        assert_eq!(pt.dims, vec![2, 3]);
        let m = pt.to_matrix();
        assert_eq!(m[[0, 2]], 3.0);
        assert_eq!(m[[1, 0]], 4.0);

        let pose = mat.vector("Pose_Para", Some(7)).unwrap();
        assert!((pose[6] - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_missing_field_and_short_vector() {
        let mut fields = HashMap::new();
        fields.insert(
            "Exp_Para".to_string(),
            MatArray {
                dims: vec![3, 1],
                data: vec![1.0, 2.0, 3.0],
            },
        );
        let mat = LabelMat::from_fields(fields);
        assert!(matches!(mat.get("roi"), Err(MatError::MissingField(_))));
        assert!(matches!(
            mat.vector("Exp_Para", Some(29)),
            Err(MatError::FieldSize { expected: 29, actual: 3, .. })
        ));
        assert_eq!(mat.vector("Exp_Para", Some(2)).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_label_mat("/nonexistent/x.mat"),
            Err(MatError::NotFound(_))
        ));
    }
}
