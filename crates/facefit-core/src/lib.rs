//! facefit-core - 3DMM coefficient layouts, label normalization and
//! landmark projection.
//!
//! Pure computation over a read-only statistical face model; no I/O beyond
//! loading the model archive.

pub mod layout;
pub mod model;
pub mod normalize;
pub mod projector;
pub mod transform;
pub mod types;

pub use layout::{Block, Layout, LayoutError, NUM_LANDMARKS};
pub use model::{FaceModel, FaceModelParts, ModelError};
pub use normalize::{Denormalizer, FrameScaling, NormalizeError};
pub use projector::{LandmarkProjector, ParamGrads, ProjectorError};
pub use transform::Projection;
pub use types::{FaceLabel, PhysicalParams, Pose};
