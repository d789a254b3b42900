use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::info;
use ventnet_core::entity::{
    AttachmentSpec, CreateRequest, FreePointSpec, JunctionPatch, JunctionSpec, LiningSpec,
    ParamValue, Patch, SegmentSpec, Side,
};
use ventnet_core::geometry::Point3;
use ventnet_engine::{ActionService, SceneEvent};
use ventnet_io::StoredScene;

/// 简易 CLI 演示：构建一段带风机、风门和风筒的小型风网，演示节点移动的撤销/重做，
/// 随后保存并创建版本，最后打印场景概览。
pub fn run_demo(service: &mut ActionService) -> Result<()> {
    let updates = Rc::new(Cell::new(0usize));
    let counter = Rc::clone(&updates);
    let listener = service.subscribe(move |event| {
        if matches!(event, SceneEvent::Updated(_)) {
            counter.set(counter.get() + 1);
        }
    });

    let junction = service.add(CreateRequest::Junction(
        JunctionSpec::new(Point3::new(40.0, 0.0, 0.0)).named("一号联络点"),
    ))?;
    let intake = service.add(CreateRequest::Segment(
        SegmentSpec::new(Point3::new(0.0, 0.0, 0.0), Point3::new(40.0, 0.0, 0.0))
            .named("进风大巷")
            .with_junctions(None, Some(junction)),
    ))?;
    let branch = service.add(CreateRequest::Segment(
        SegmentSpec::new(Point3::new(40.0, 0.0, 0.0), Point3::new(40.0, -8.0, 30.0))
            .named("回风斜巷")
            .with_junctions(Some(junction), None),
    ))?;
    service.add(CreateRequest::Attachment(
        AttachmentSpec::fan(intake, 0.25).named("局部通风机"),
    ))?;
    service.add(CreateRequest::Attachment(
        AttachmentSpec::structure(branch, 0.6, "door")
            .named("调节风门")
            .on_side(Side::Right, 0.5),
    ))?;
    service.add(CreateRequest::Lining(LiningSpec::new(intake)))?;
    service.add(CreateRequest::FreePoint(
        FreePointSpec::new(Point3::new(12.0, 3.0, 0.0)).named("测风点"),
    ))?;
    service.set_parameters(
        intake,
        BTreeMap::from([
            ("tunnelAlpha".to_string(), ParamValue::Number(0.015)),
            ("supportType".to_string(), ParamValue::Text("锚喷".to_string())),
        ]),
    )?;

    service.update(
        junction,
        Patch::Junction(JunctionPatch {
            position: Some(Point3::new(45.0, 0.0, 0.0)),
            ..JunctionPatch::default()
        }),
    )?;
    let moved_end = service
        .graph()
        .segment(intake)
        .map(|segment| segment.end)
        .context("进风大巷缺失")?;
    service.handle_undo()?;
    service.handle_redo()?;

    let scene_id = service.save(None)?;
    let version_id = service.create_version(Some("初始布置"))?;
    service.unsubscribe(listener);

    let stats = service.history().stats();
    info!(
        entities = service.graph().len(),
        history = stats.total,
        updates = updates.get(),
        "CLI 演示统计"
    );

    println!("ventnet CLI 演示");
    println!("场景已保存：{scene_id}");
    println!("版本已创建：{version_id}");
    println!(
        "节点移动后进风大巷终点=({:.2}, {:.2}, {:.2})",
        moved_end.x(),
        moved_end.y(),
        moved_end.z()
    );
    println!(
        "历史记录 {} 条，当前位置 {}，可撤销={}，可重做={}",
        stats.total, stats.current, stats.can_undo, stats.can_redo
    );
    println!("收到更新事件 {} 次", updates.get());

    let data = service.graph().scene_data();
    println!("当前场景实体：");
    for item in &data.items {
        let mut line = format!(
            "  - {} #{} {} @ ({:.2}, {:.2}, {:.2})",
            item.kind,
            item.id,
            item.name,
            item.position.x(),
            item.position.y(),
            item.position.z()
        );
        if let Some(length) = item.length {
            line.push_str(&format!(", 长度={length:.2}"));
        }
        if let Some(lining) = service.graph().lining_of(item.id) {
            line.push_str(&format!(", 风筒=#{}", lining.id));
        }
        if let Some(segment) = item.segment_id {
            line.push_str(&format!(", 所属巷道=#{segment}"));
        }
        if item.has_parameters {
            line.push_str(", 含参数");
        }
        println!("{line}");
    }
    if let Some(bounds) = service.graph().bounds() {
        let (min, max) = (bounds.min(), bounds.max());
        println!(
            "场景范围=({:.2}, {:.2}, {:.2}) ~ ({:.2}, {:.2}, {:.2})",
            min.x(),
            min.y(),
            min.z(),
            max.x(),
            max.y(),
            max.z()
        );
    }
    Ok(())
}

pub fn print_records(service: &ActionService) -> Result<()> {
    let records = service.store().list_meta()?;
    if records.is_empty() {
        println!("存储中没有场景记录。");
        return Ok(());
    }
    for meta in records {
        let origin = match &meta.original_id {
            Some(original) => format!(" (版本，源={original})"),
            None => String::new(),
        };
        println!(
            "{}\t{}\tv{}\t{}{}",
            meta.id, meta.name, meta.version, meta.last_modified, origin
        );
    }
    Ok(())
}

pub fn print_versions(service: &ActionService, id: &str) -> Result<()> {
    let versions = service.store().list_versions(id)?;
    if versions.is_empty() {
        println!("场景 {id} 没有版本。");
        return Ok(());
    }
    for StoredScene {
        id, name, version, snapshot, ..
    } in versions
    {
        println!(
            "{id}\t{name}\tv{version}\t实体 {}",
            snapshot.entity_count()
        );
    }
    Ok(())
}
