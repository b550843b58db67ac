//! Double-precision transform decomposition and axis-aligned bounding boxes.

use glam::{DMat4, DQuat, DVec3};
use tracing::debug;

/// A decomposed affine transform. The rotation is always normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformComponents {
    pub translation: DVec3,
    pub rotation: DQuat,
    pub scale: DVec3,
}

impl Default for TransformComponents {
    fn default() -> Self {
        Self {
            translation: DVec3::ZERO,
            rotation: DQuat::IDENTITY,
            scale: DVec3::ONE,
        }
    }
}

impl TransformComponents {
    pub fn to_matrix(&self) -> DMat4 {
        DMat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Decompose a matrix into TRS components.
    ///
    /// Reflections (negative determinant) land on the sign of `scale.x`. A
    /// degenerate rotation is replaced with identity, and any measurable
    /// round-trip divergence is reported at debug level; the decomposition is
    /// used regardless (best effort).
    pub fn from_matrix(matrix: &DMat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        let rotation = if rotation.is_finite() && rotation.length_squared() > 0.0 {
            rotation.normalize()
        } else {
            DQuat::IDENTITY
        };
        let components = Self {
            translation,
            rotation,
            scale,
        };

        let difference = *matrix - components.to_matrix();
        let divergence: f64 = difference
            .to_cols_array()
            .iter()
            .map(|d| d * d)
            .sum::<f64>()
            .sqrt();
        if divergence > 1e-6 {
            debug!("matrix decomposition diverges by {divergence:.3e}; using best-effort TRS");
        }
        components
    }
}

/// Axis-aligned min/max bounds. The default value is invalid (empty) and acts
/// as the identity for [`BoundingBox::merge`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            min: DVec3::splat(f64::MAX),
            max: DVec3::splat(f64::MIN),
        }
    }
}

impl BoundingBox {
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn expand(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Transform by an affine matrix: maps the eight corners and refits.
    pub fn transformed(&self, matrix: &DMat4) -> BoundingBox {
        if !self.is_valid() {
            return *self;
        }
        let mut out = BoundingBox::default();
        for corner in self.corners() {
            out.expand(matrix.transform_point3(corner));
        }
        out
    }

    fn corners(&self) -> [DVec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            DVec3::new(a.x, a.y, a.z),
            DVec3::new(b.x, a.y, a.z),
            DVec3::new(a.x, b.y, a.z),
            DVec3::new(a.x, a.y, b.z),
            DVec3::new(b.x, b.y, a.z),
            DVec3::new(b.x, a.y, b.z),
            DVec3::new(a.x, b.y, b.z),
            DVec3::new(b.x, b.y, b.z),
        ]
    }

    /// The 3D Tiles `box` form: center plus three half-axes aligned to the
    /// world axes.
    pub fn to_tileset_box(&self) -> [f64; 12] {
        if !self.is_valid() {
            return [0.0; 12];
        }
        let center = (self.min + self.max) * 0.5;
        let half = (self.max - self.min) * 0.5;
        [
            center.x, center.y, center.z, // center
            half.x, 0.0, 0.0, // x half-axis
            0.0, half.y, 0.0, // y half-axis
            0.0, 0.0, half.z, // z half-axis
        ]
    }

    /// Component-wise min/max comparison within `tolerance`. Invalid boxes
    /// never compare similar.
    pub fn similar_to(&self, other: &BoundingBox, tolerance: f64) -> bool {
        if !self.is_valid() || !other.is_valid() {
            return false;
        }
        (self.min - other.min).abs().max_element() <= tolerance
            && (self.max - other.max).abs().max_element() <= tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_3;

    fn assert_mat_close(a: &DMat4, b: &DMat4) {
        for (x, y) in a.to_cols_array().iter().zip(b.to_cols_array().iter()) {
            assert!((x - y).abs() < 1e-9, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_decompose_round_trip() {
        let original = DMat4::from_scale_rotation_translation(
            DVec3::new(2.0, 3.0, 0.5),
            DQuat::from_rotation_y(FRAC_PI_3),
            DVec3::new(10.0, -4.0, 7.5),
        );
        let components = TransformComponents::from_matrix(&original);
        assert_mat_close(&original, &components.to_matrix());
        assert!((components.rotation.length() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_decompose_reflection_signs_scale_x() {
        let original = DMat4::from_scale_rotation_translation(
            DVec3::new(-1.5, 2.0, 1.0),
            DQuat::IDENTITY,
            DVec3::ZERO,
        );
        let components = TransformComponents::from_matrix(&original);
        assert!(components.scale.x < 0.0);
        assert_mat_close(&original, &components.to_matrix());
    }

    #[test]
    fn test_identity_components() {
        let components = TransformComponents::default();
        assert_mat_close(&components.to_matrix(), &DMat4::IDENTITY);
    }

    #[test]
    fn test_bounding_box_merge() {
        let mut a = BoundingBox::default();
        assert!(!a.is_valid());
        a.merge(&BoundingBox {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        });
        a.merge(&BoundingBox {
            min: DVec3::new(-1.0, 0.0, 0.5),
            max: DVec3::new(0.5, 2.0, 3.0),
        });
        assert_eq!(a.min, DVec3::new(-1.0, 0.0, 0.0));
        assert_eq!(a.max, DVec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_merge_ignores_invalid() {
        let mut a = BoundingBox {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        a.merge(&BoundingBox::default());
        assert_eq!(a.min, DVec3::ZERO);
        assert_eq!(a.max, DVec3::ONE);
    }

    #[test]
    fn test_transform_by_translation() {
        let b = BoundingBox {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        let moved = b.transformed(&DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0)));
        assert_eq!(moved.min, DVec3::new(10.0, 0.0, 0.0));
        assert_eq!(moved.max, DVec3::new(11.0, 1.0, 1.0));
    }

    #[test]
    fn test_transform_by_rotation_refits() {
        let b = BoundingBox {
            min: DVec3::new(-1.0, -1.0, -1.0),
            max: DVec3::new(1.0, 1.0, 1.0),
        };
        // 45 degrees around y: the unit cube's xz footprint grows to sqrt(2).
        let rotated = b.transformed(&DMat4::from_quat(DQuat::from_rotation_y(
            std::f64::consts::FRAC_PI_4,
        )));
        assert!((rotated.max.x - 2f64.sqrt()).abs() < 1e-9);
        assert!((rotated.max.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tileset_box() {
        let b = BoundingBox {
            min: DVec3::new(0.0, 2.0, -4.0),
            max: DVec3::new(2.0, 6.0, 0.0),
        };
        let array = b.to_tileset_box();
        assert_eq!(&array[0..3], &[1.0, 4.0, -2.0]);
        assert_eq!(array[3], 1.0);
        assert_eq!(array[7], 2.0);
        assert_eq!(array[11], 2.0);
    }

    #[test]
    fn test_similarity_tolerance() {
        let a = BoundingBox {
            min: DVec3::ZERO,
            max: DVec3::ONE,
        };
        let b = BoundingBox {
            min: DVec3::splat(1e-5),
            max: DVec3::ONE,
        };
        assert!(a.similar_to(&b, 1e-4));
        assert!(!a.similar_to(&b, 1e-6));
        assert!(!a.similar_to(&BoundingBox::default(), 1.0));
    }
}
