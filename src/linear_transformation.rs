//! Linear mapping between engineering units and raw converter codes.

/// A structure for mapping values between two different domains.
#[derive(serde::Serialize, serde::Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct LinearTransformation {
    slope: f32,
    offset: f32,
}

impl LinearTransformation {
    /// Construct a new linear transformation.
    ///
    /// # Args
    /// * `slope` - The slope of the y = mx + b equation.
    /// * `offset` - The y-intercept. Equals the b portion of y = mx + b.
    pub fn new(slope: f32, offset: f32) -> Self {
        LinearTransformation { slope, offset }
    }

    /// Construct the transformation passing through two points.
    ///
    /// # Note
    /// Degenerate segments (`x1 == x2`) yield an identity mapping so that a badly
    /// configured segment passes values through unchanged instead of producing NaN.
    ///
    /// # Args
    /// * `(x1, y1)` - The first point of the segment.
    /// * `(x2, y2)` - The second point of the segment.
    pub fn from_points((x1, y1): (f32, f32), (x2, y2): (f32, f32)) -> Self {
        if x1 == x2 {
            return Self::new(1.0, 0.0);
        }

        let slope = (y2 - y1) / (x2 - x1);
        Self::new(slope, y1 - slope * x1)
    }

    /// Convert a value from the Y-domain into the X-domain.
    ///
    /// # Note
    /// This is accomplished by inverting the equation y=mx + b, such that y, m, and b are known.
    ///
    /// # Args
    /// * `vertical` - The Y-axis value to convert into the X-axis.
    pub fn invert(&self, vertical: f32) -> f32 {
        (vertical - self.offset) / self.slope
    }

    /// Map a value from the X-domain into the Y-domain using a linear equation.
    ///
    /// # Args
    /// * `horizontal` - The X-axis value to map into the Y-axis.
    pub fn map(&self, horizontal: f32) -> f32 {
        horizontal * self.slope + self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_through_points() {
        let transform = LinearTransformation::from_points((0.0, 1.0), (10.0, 21.0));
        assert_eq!(transform.map(5.0), 11.0);
        assert_eq!(transform.invert(21.0), 10.0);
    }

    #[test]
    fn degenerate_segment_is_identity() {
        let transform = LinearTransformation::from_points((3.0, 1.0), (3.0, 7.0));
        assert_eq!(transform.map(4.2), 4.2);
    }
}
