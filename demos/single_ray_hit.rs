//! Smallest possible graph: one triangle, one ray, read XYZ/DISTANCE/IS_HIT
//! back through a yield node. Mirrors spec.md §8 scenario 1.

use gpu_pointcloud_sim::field::Field;
use gpu_pointcloud_sim::graph::{CancelToken, Graph};
use gpu_pointcloud_sim::node::misc::YieldNode;
use gpu_pointcloud_sim::node::raytrace::{RayTraceNode, RayTraceParams};
use gpu_pointcloud_sim::node::rays::FromMatrixRaysNode;
use gpu_pointcloud_sim::{config::DeviceConfig, device::GpuContext, types::M3x4f, Scene, V3f, V3i};

#[tokio::main]
async fn main() {
    let ctx = GpuContext::new(&DeviceConfig::from_env()).await.expect("no suitable GPU adapter");

    let mut scene = Scene::new();
    let mesh = scene
        .add_mesh(
            &ctx.device,
            &[V3f::new(0.0, 0.0, 0.0), V3f::new(1.0, 0.0, 0.0), V3f::new(0.0, 1.0, 0.0)],
            &[V3i::new(0, 1, 2)],
        )
        .expect("triangle geometry is valid");
    scene
        .add_entity(mesh, M3x4f::from_affine(&glam::Affine3A::IDENTITY), 0, None)
        .expect("mesh exists");

    let ray = glam::Affine3A::from_cols(
        glam::Vec3::X.extend(0.0),
        glam::Vec3::Y.extend(0.0),
        (-glam::Vec3::Z).extend(0.0),
        glam::Vec3::new(0.25, 0.25, 1.0).extend(1.0),
    );

    let mut graph = Graph::new();
    let rays = graph.add_node(Box::new(FromMatrixRaysNode::new(vec![M3x4f::from_affine(&ray)])));
    let trace = graph.add_node(Box::new(RayTraceNode::new(rays, RayTraceParams { range_max: 10.0, ..Default::default() })));
    graph.connect(trace, rays).unwrap();
    let out = graph.add_node(Box::new(YieldNode::new(
        trace,
        vec![Field::Xyz, Field::Distance, Field::IsHit, Field::RayIdx],
    )));
    graph.connect(out, trace).unwrap();

    let run = graph
        .run(&[out], &ctx.device, &ctx.queue, Some(&mut scene), CancelToken::new())
        .expect("graph is valid");
    run.synchronize(&ctx.device);

    let xyz = graph.get_field_data(&run, out, Field::Xyz, &ctx.device, &ctx.queue).unwrap();
    let hit = graph.get_field_data(&run, out, Field::IsHit, &ctx.device, &ctx.queue).unwrap();
    let xyz = xyz.as_vec3().unwrap().read_to_vec(&ctx.device, &ctx.queue);
    let hit = hit.as_flag().unwrap().read_to_vec(&ctx.device, &ctx.queue);

    println!("hit point: {:?}, is_hit: {}", xyz[0], hit[0] != 0);
}
