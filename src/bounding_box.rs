use glam::Vec3;

/// Axis-aligned bounding box.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    /// Location with the lowest X, Y, and Z coordinates contained by the box.
    pub min: Vec3,
    /// Location with the highest X, Y, and Z coordinates contained by the box.
    pub max: Vec3,
}

impl BoundingBox {
    #[inline(always)]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// A box that contains nothing and expands to its partner under merging.
    /// The extents are negative, so the bounds metric of this box is zero.
    #[inline(always)]
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    /// Computes a bounding box which contains two other bounding boxes.
    #[inline(always)]
    pub fn create_merged(
        min_a: Vec3,
        max_a: Vec3,
        min_b: Vec3,
        max_b: Vec3,
        min: &mut Vec3,
        max: &mut Vec3,
    ) {
        *min = min_a.min(min_b);
        *max = max_a.max(max_b);
    }

    /// Expands this box to contain another box.
    #[inline(always)]
    pub fn merge_with(&mut self, other: &BoundingBox) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_merge_identity() {
        let b = BoundingBox::new(Vec3::new(-1.0, 0.0, 2.0), Vec3::new(3.0, 4.0, 5.0));
        let mut merged = BoundingBox::empty();
        merged.merge_with(&b);
        assert_eq!(merged, b);
    }

    #[test]
    fn merge_covers_both() {
        let a = BoundingBox::new(Vec3::ZERO, Vec3::ONE);
        let b = BoundingBox::new(Vec3::splat(-2.0), Vec3::splat(-1.0));
        let mut min = Vec3::ZERO;
        let mut max = Vec3::ZERO;
        BoundingBox::create_merged(a.min, a.max, b.min, b.max, &mut min, &mut max);
        assert_eq!(min, Vec3::splat(-2.0));
        assert_eq!(max, Vec3::ONE);
    }
}
