pub mod entity;
pub mod graph;
pub mod resolver;
pub mod snapshot;

pub mod geometry {
    use glam::DVec3;
    use serde::{Deserialize, Serialize};

    /// 场景竖直方向（与前端 Three.js 坐标系一致，Y 轴向上）。
    pub const UP: DVec3 = DVec3::Y;

    /// 三维点，内部以 `glam::DVec3` 表示，序列化为 `{x, y, z}`。
    #[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
    #[serde(from = "Xyz", into = "Xyz")]
    pub struct Point3(pub DVec3);

    impl Point3 {
        pub const ORIGIN: Point3 = Point3(DVec3::ZERO);

        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn from_vec(vec: DVec3) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn z(self) -> f64 {
            self.0.z
        }

        #[inline]
        pub fn translate(self, offset: Vector3) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point3) -> Vector3 {
            Vector3(other.0 - self.0)
        }

        #[inline]
        pub fn distance(self, other: Point3) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }

        /// 按小数位数取整，保证序列化后数值稳定。
        pub fn rounded(self, decimals: u32) -> Self {
            Self::new(
                round_to(self.0.x, decimals),
                round_to(self.0.y, decimals),
                round_to(self.0.z, decimals),
            )
        }
    }

    impl From<DVec3> for Point3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    /// 三维向量，用于方向、朝向与偏移。
    #[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
    #[serde(from = "Xyz", into = "Xyz")]
    pub struct Vector3(pub DVec3);

    impl Vector3 {
        pub const X: Vector3 = Vector3(DVec3::X);
        pub const Z: Vector3 = Vector3(DVec3::Z);

        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn length_squared(self) -> f64 {
            self.0.length_squared()
        }

        #[inline]
        pub fn normalize(self) -> Option<Self> {
            let len = self.0.length();
            if len <= f64::EPSILON {
                None
            } else {
                Some(Self(self.0 / len))
            }
        }

        #[inline]
        pub fn scale(self, factor: f64) -> Self {
            Self(self.0 * factor)
        }

        #[inline]
        pub fn dot(self, other: Vector3) -> f64 {
            self.0.dot(other.0)
        }

        #[inline]
        pub fn cross(self, other: Vector3) -> Vector3 {
            Self(self.0.cross(other.0))
        }

        pub fn rounded(self, decimals: u32) -> Self {
            Self::new(
                round_to(self.0.x, decimals),
                round_to(self.0.y, decimals),
                round_to(self.0.z, decimals),
            )
        }
    }

    impl From<DVec3> for Vector3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Xyz {
        x: f64,
        y: f64,
        z: f64,
    }

    impl From<Xyz> for Point3 {
        fn from(value: Xyz) -> Self {
            Point3::new(value.x, value.y, value.z)
        }
    }

    impl From<Point3> for Xyz {
        fn from(value: Point3) -> Self {
            Xyz {
                x: value.0.x,
                y: value.0.y,
                z: value.0.z,
            }
        }
    }

    impl From<Xyz> for Vector3 {
        fn from(value: Xyz) -> Self {
            Vector3::new(value.x, value.y, value.z)
        }
    }

    impl From<Vector3> for Xyz {
        fn from(value: Vector3) -> Self {
            Xyz {
                x: value.0.x,
                y: value.0.y,
                z: value.0.z,
            }
        }
    }

    /// 四舍五入到指定小数位；非有限值，以及放大后溢出的极大值原样返回。
    pub fn round_to(value: f64, decimals: u32) -> f64 {
        if !value.is_finite() {
            return value;
        }
        let factor = 10f64.powi(decimals.min(15) as i32);
        let scaled = value * factor;
        if !scaled.is_finite() {
            return value;
        }
        let rounded = scaled.round() / factor;
        // 避免输出 -0.0
        if rounded == 0.0 { 0.0 } else { rounded }
    }

    /// 轴对齐边界框，用于估算场景范围与中心。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Bounds3 {
        min: Point3,
        max: Point3,
    }

    impl Bounds3 {
        #[inline]
        pub fn new(min: Point3, max: Point3) -> Self {
            Self { min, max }
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
                max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y() || self.min.z() > self.max.z()
        }

        #[inline]
        pub fn min(&self) -> Point3 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point3 {
            self.max
        }

        pub fn include_point(&mut self, point: Point3) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            self.min = Point3::from_vec(self.min.as_vec3().min(point.as_vec3()));
            self.max = Point3::from_vec(self.max.as_vec3().max(point.as_vec3()));
        }

        #[inline]
        pub fn center(&self) -> Point3 {
            debug_assert!(!self.is_empty());
            Point3::from_vec((self.min.as_vec3() + self.max.as_vec3()) * 0.5)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_to_handles_negative_zero_and_precision() {
            assert_eq!(round_to(1.23456, 2), 1.23);
            assert_eq!(round_to(-0.0001, 2), 0.0);
            assert!(round_to(-0.0001, 2).is_sign_positive());
            assert!(round_to(f64::NAN, 3).is_nan());
        }

        #[test]
        fn round_to_keeps_values_too_large_to_scale() {
            assert_eq!(round_to(1e305, 6), 1e305);
            assert_eq!(round_to(-1.5e303, 6), -1.5e303);
            assert!(round_to(f64::MAX, 15).is_finite());
            assert_eq!(round_to(1e12, 6), 1e12);
        }

        #[test]
        fn bounds_track_min_max_and_center() {
            let mut bounds = Bounds3::empty();
            assert!(bounds.is_empty());
            bounds.include_point(Point3::new(0.0, 2.0, -4.0));
            bounds.include_point(Point3::new(10.0, -2.0, 4.0));
            assert_eq!(bounds.min(), Point3::new(0.0, -2.0, -4.0));
            assert_eq!(bounds.max(), Point3::new(10.0, 2.0, 4.0));
            assert_eq!(bounds.center(), Point3::new(5.0, 0.0, 0.0));
        }

        #[test]
        fn vector_normalize_rejects_zero_length() {
            assert!(Vector3::new(0.0, 0.0, 0.0).normalize().is_none());
            let unit = Vector3::new(3.0, 0.0, 4.0).normalize().expect("non-zero");
            assert!((unit.length() - 1.0).abs() < 1e-12);
        }
    }
}

pub mod errors {
    use thiserror::Error;

    use crate::entity::EntityId;

    /// 实体图上的失败类型。所有变更在返回错误前都已完整回滚。
    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum GraphError {
        #[error("entity with id {0} not found")]
        NotFound(EntityId),
        #[error("integrity violation: {0}")]
        Integrity(String),
        #[error("invalid properties: {0}")]
        Validation(String),
    }

    impl GraphError {
        pub(crate) fn integrity(message: impl Into<String>) -> Self {
            Self::Integrity(message.into())
        }

        pub(crate) fn validation(message: impl Into<String>) -> Self {
            Self::Validation(message.into())
        }
    }
}

pub use entity::EntityId;
pub use errors::GraphError;
pub use graph::EntityGraph;
