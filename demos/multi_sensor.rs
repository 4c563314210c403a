//! Two sensors sharing one scene: a dense lidar-style ray fan feeding a
//! compact+transform chain, and the same trace feeding a radar postprocess
//! chain that clusters the hits. Entities are then moved and the scene is
//! re-run to exercise the IAS refit path (spec.md §4.1, §8 scenario 3),
//! visualized live through `rerun` the way the teacher's `multi_sensor`
//! example does.

use glam::{Affine3A, Quat, Vec3};

use gpu_pointcloud_sim::config::DeviceConfig;
use gpu_pointcloud_sim::device::GpuContext;
use gpu_pointcloud_sim::field::Field;
use gpu_pointcloud_sim::graph::{CancelToken, Graph};
use gpu_pointcloud_sim::node::compact::CompactByFieldNode;
use gpu_pointcloud_sim::node::misc::YieldNode;
use gpu_pointcloud_sim::node::radar::{RadarPostprocessNode, RadarPostprocessParams};
use gpu_pointcloud_sim::node::raytrace::{RayTraceNode, RayTraceParams};
use gpu_pointcloud_sim::node::rays::FromMatrixRaysNode;
use gpu_pointcloud_sim::types::{M3x4f, V3f, V3i};
use gpu_pointcloud_sim::Scene;

/// A unit cube, grounded in the teacher's `utils::create_cube`.
fn cube(size: f32) -> (Vec<V3f>, Vec<V3i>) {
    let s = size;
    let vertices = vec![
        V3f::new(-s, -s, -s),
        V3f::new(s, -s, -s),
        V3f::new(s, s, -s),
        V3f::new(-s, s, -s),
        V3f::new(-s, -s, s),
        V3f::new(s, -s, s),
        V3f::new(s, s, s),
        V3f::new(-s, s, s),
    ];
    let indices = vec![
        V3i::new(0, 1, 2),
        V3i::new(2, 3, 0),
        V3i::new(4, 6, 5),
        V3i::new(4, 7, 6),
        V3i::new(0, 4, 5),
        V3i::new(0, 5, 1),
        V3i::new(1, 5, 6),
        V3i::new(1, 6, 2),
        V3i::new(2, 6, 7),
        V3i::new(2, 7, 3),
        V3i::new(3, 7, 4),
        V3i::new(3, 4, 0),
    ];
    (vertices, indices)
}

fn lidar_fan(beams: usize) -> Vec<M3x4f> {
    (0..beams)
        .map(|i| {
            let angle = std::f32::consts::PI * i as f32 / beams as f32;
            let dir = Vec3::new(0.0, angle.sin(), -angle.cos());
            let rot = Quat::from_rotation_arc(Vec3::NEG_Z, dir.normalize());
            M3x4f::from_affine(&Affine3A::from_rotation_translation(rot, Vec3::ZERO))
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let ctx = GpuContext::new(&DeviceConfig::from_env()).await.expect("no suitable GPU adapter");

    #[cfg(feature = "visualization")]
    let rec = rerun::RecordingStreamBuilder::new("multi_sensor_demo").spawn().unwrap();

    let mut scene = Scene::new();
    let (verts, idx) = cube(1.0);
    let mesh = scene.add_mesh(&ctx.device, &verts, &idx).expect("cube geometry is valid");

    let side = 4;
    let mut entities = Vec::new();
    for x in 0..side {
        for y in 0..side {
            let transform = M3x4f::from_affine(&Affine3A::from_rotation_translation(
                Quat::from_rotation_y(45.9_f32.to_radians()),
                Vec3::new(x as f32 * 3.0, y as f32 * 3.0, -30.0),
            ));
            entities.push(scene.add_entity(mesh, transform, (x * side + y) as u32, None).unwrap());
        }
    }

    let mut graph = Graph::new();
    let rays = graph.add_node(Box::new(FromMatrixRaysNode::new(lidar_fan(256))));
    let trace = graph.add_node(Box::new(RayTraceNode::new(
        rays,
        RayTraceParams { range_max: 100.0, ..Default::default() },
    )));
    graph.connect(trace, rays).unwrap();

    let compacted = graph.add_node(Box::new(CompactByFieldNode::new(trace, Field::IsHit)));
    graph.connect(compacted, trace).unwrap();
    let lidar_out = graph.add_node(Box::new(YieldNode::new(compacted, vec![Field::Xyz, Field::Distance])));
    graph.connect(lidar_out, compacted).unwrap();

    let radar = graph.add_node(Box::new(RadarPostprocessNode::new(
        trace,
        RadarPostprocessParams { distance_separation: 0.5, azimuth_separation: 1.0_f32.to_radians() },
    )));
    graph.connect(radar, trace).unwrap();
    let radar_out = graph.add_node(Box::new(YieldNode::new(radar, vec![Field::Xyz, Field::Distance])));
    graph.connect(radar_out, radar).unwrap();

    for frame in 0..3 {
        let run = graph
            .run(&[lidar_out, radar_out], &ctx.device, &ctx.queue, Some(&mut scene), CancelToken::new())
            .expect("graph is valid");
        run.synchronize(&ctx.device);

        let lidar_xyz = graph
            .get_field_data(&run, lidar_out, Field::Xyz, &ctx.device, &ctx.queue)
            .unwrap()
            .as_vec3()
            .unwrap()
            .read_to_vec(&ctx.device, &ctx.queue);
        let radar_xyz = graph
            .get_field_data(&run, radar_out, Field::Xyz, &ctx.device, &ctx.queue)
            .unwrap()
            .as_vec3()
            .unwrap()
            .read_to_vec(&ctx.device, &ctx.queue);

        println!(
            "frame {frame}: {} lidar hits, {} radar clusters",
            lidar_xyz.len(),
            radar_xyz.len()
        );

        #[cfg(feature = "visualization")]
        {
            let points: Vec<_> = lidar_xyz.iter().map(|p| [p.x, p.y, p.z]).collect();
            rec.log("lidar_cloud", &rerun::Points3D::new(points)).unwrap();
            let centers: Vec<_> = radar_xyz.iter().map(|p| [p.x, p.y, p.z]).collect();
            rec.log("radar_clusters", &rerun::Points3D::new(centers)).unwrap();
        }

        // Move every entity forward one step; only transforms changed, so the
        // next commit refits the IAS instead of rebuilding it.
        for (i, entity) in entities.iter().enumerate() {
            let transform = M3x4f::from_affine(&Affine3A::from_rotation_translation(
                Quat::from_rotation_y(45.9_f32.to_radians()),
                Vec3::new((i / side) as f32 * 3.0, (i % side) as f32 * 3.0, -30.0 + frame as f32 * 5.0),
            ));
            scene.set_transform(*entity, transform).unwrap();
        }
    }
}
