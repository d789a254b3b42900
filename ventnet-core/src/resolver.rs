//! 依附物位置解算。纯函数，无隐藏状态，实体图与外部渲染器共用。

use crate::entity::{Segment, Side};
use crate::geometry::{Point3, UP, Vector3};

/// 依附物在世界坐标中的位置与朝向。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub position: Point3,
    /// 沿巷道方向的单位向量。
    pub forward: Vector3,
    /// 水平面内指向巷道左侧的单位向量。
    pub lateral: Vector3,
}

/// 风筒沿巷道的派生几何。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiningSpan {
    pub start: Point3,
    pub end: Point3,
    pub radius: f64,
}

/// 将相对位置限制在 [0, 1]；NaN 视为 0。
#[inline]
pub fn clamp_relative(relative_position: f64) -> f64 {
    if relative_position.is_nan() {
        0.0
    } else {
        relative_position.clamp(0.0, 1.0)
    }
}

/// 巷道的水平侧向轴；竖井（方向与竖直轴平行）回退到 +Z。
pub fn lateral_axis(forward: Vector3) -> Vector3 {
    Vector3(UP).cross(forward).normalize().unwrap_or(Vector3::Z)
}

/// 计算依附物位置：
/// `start + forward * (t * length) + 侧向偏移`。
/// 左右偏移量为 `width / 2 + lateral_offset`，上下为 `height / 2 + lateral_offset`。
pub fn position_of(
    segment: &Segment,
    relative_position: f64,
    side: Side,
    lateral_offset: f64,
) -> Placement {
    let t = clamp_relative(relative_position);
    let forward = segment.direction();
    let lateral = lateral_axis(forward);
    let normal = forward.cross(lateral).normalize().unwrap_or(Vector3(UP));

    let half_width = segment.width * 0.5 + lateral_offset;
    let half_height = segment.height * 0.5 + lateral_offset;
    let offset = match side {
        Side::Center => Vector3::default(),
        Side::Left => lateral.scale(half_width),
        Side::Right => lateral.scale(-half_width),
        Side::Above => normal.scale(half_height),
        Side::Below => normal.scale(-half_height),
    };

    let along = forward.scale(t * segment.length());
    Placement {
        position: segment.start.translate(along).translate(offset),
        forward,
        lateral,
    }
}

/// 风筒覆盖层跟随巷道中心线，半径取断面较大边的一半加间隙。
pub fn lining_span(segment: &Segment, clearance: f64) -> LiningSpan {
    LiningSpan {
        start: segment.start,
        end: segment.end,
        radius: segment.width.max(segment.height) * 0.5 + clearance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, SegmentSpec};
    use proptest::prelude::*;

    fn segment(start: Point3, end: Point3) -> Segment {
        let spec = SegmentSpec::new(start, end);
        Segment {
            id: EntityId::new(1),
            name: String::new(),
            start: spec.start,
            end: spec.end,
            width: 4.0,
            height: 2.0,
            size: 0.0,
            color: spec.color,
            airflow: 0.0,
            key_area: 0.0,
            start_junction: None,
            end_junction: None,
            node_id: String::new(),
            group_id: String::new(),
        }
    }

    #[test]
    fn midpoint_on_horizontal_segment() {
        let seg = segment(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0));
        let placement = position_of(&seg, 0.5, Side::Center, 0.0);
        assert_eq!(placement.position, Point3::new(5.0, 0.0, 0.0));
        assert_eq!(placement.forward, Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn out_of_range_positions_are_clamped() {
        let seg = segment(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0));
        assert_eq!(
            position_of(&seg, -3.0, Side::Center, 0.0).position,
            Point3::new(0.0, 0.0, 0.0)
        );
        assert_eq!(
            position_of(&seg, 7.0, Side::Center, 0.0).position,
            Point3::new(10.0, 0.0, 0.0)
        );
        assert_eq!(clamp_relative(f64::NAN), 0.0);
    }

    #[test]
    fn side_offsets_are_perpendicular() {
        let seg = segment(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0));
        let left = position_of(&seg, 0.5, Side::Left, 1.0).position;
        let right = position_of(&seg, 0.5, Side::Right, 1.0).position;
        let above = position_of(&seg, 0.5, Side::Above, 0.0).position;
        let below = position_of(&seg, 0.5, Side::Below, 0.5).position;

        // 左右偏移 = width / 2 + 1
        assert!((left.distance(Point3::new(5.0, 0.0, 0.0)) - 3.0).abs() < 1e-12);
        assert!((left.z() + right.z()).abs() < 1e-12);
        assert!((left.x() - 5.0).abs() < 1e-12);
        assert!((above.y() - 1.0).abs() < 1e-12);
        assert!((below.y() + 1.5).abs() < 1e-12);
    }

    #[test]
    fn vertical_shaft_uses_fallback_axis() {
        let seg = segment(Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 10.0, 0.0));
        let placement = position_of(&seg, 0.25, Side::Left, 0.0);
        assert_eq!(placement.lateral, Vector3::Z);
        assert!((placement.position.y() - 2.5).abs() < 1e-12);
        assert!((placement.position.z() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn resolver_is_bit_identical_on_repeat() {
        let seg = segment(
            Point3::new(1.137, -2.5, 0.333),
            Point3::new(-7.25, 4.125, 9.001),
        );
        for (i, side) in [Side::Center, Side::Left, Side::Right, Side::Above, Side::Below]
            .into_iter()
            .enumerate()
        {
            let t = 0.1 + i as f64 * 0.17;
            let first = position_of(&seg, t, side, 0.3);
            let second = position_of(&seg, t, side, 0.3);
            assert_eq!(
                first.position.as_vec3().to_array().map(f64::to_bits),
                second.position.as_vec3().to_array().map(f64::to_bits)
            );
            assert_eq!(first, second);
        }
    }

    fn sides() -> impl Strategy<Value = Side> {
        prop_oneof![
            Just(Side::Center),
            Just(Side::Left),
            Just(Side::Right),
            Just(Side::Above),
            Just(Side::Below),
        ]
    }

    fn coords() -> impl Strategy<Value = Point3> {
        prop::array::uniform3(-1.0e4f64..1.0e4).prop_map(|[x, y, z]| Point3::new(x, y, z))
    }

    proptest! {
        #[test]
        fn generated_placements_are_bit_identical_and_stay_on_segment(
            start in coords(),
            end in coords(),
            t in -2.0f64..3.0,
            side in sides(),
            offset in 0.0f64..5.0,
        ) {
            let seg = segment(start, end);
            let first = position_of(&seg, t, side, offset);
            let second = position_of(&seg, t, side, offset);
            prop_assert_eq!(
                first.position.as_vec3().to_array().map(f64::to_bits),
                second.position.as_vec3().to_array().map(f64::to_bits)
            );
            prop_assert_eq!(first, second);

            // 中心线上的点不会越过端点
            let centre = position_of(&seg, t, Side::Center, offset).position;
            let slack = 1e-9 * (1.0 + seg.length());
            prop_assert!(centre.distance(seg.start) <= seg.length() + slack);
            prop_assert!(centre.distance(seg.end) <= seg.length() + slack);
        }
    }

    #[test]
    fn lining_radius_uses_larger_section_side() {
        let seg = segment(Point3::new(0.0, 0.0, 0.0), Point3::new(5.0, 0.0, 0.0));
        let span = lining_span(&seg, 0.5);
        assert_eq!(span.start, seg.start);
        assert_eq!(span.end, seg.end);
        assert!((span.radius - 2.5).abs() < 1e-12);
    }
}
