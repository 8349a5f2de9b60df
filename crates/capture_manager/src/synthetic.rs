//! Procedural stand-in for the game world: a render-thread scene that draws a
//! lawn with a wall and drifting trees, and a matching world query.

use capture_config::{TREE_STENCIL_ID, WALL_STENCIL_ID};
use capture_protocol::{CaptureView, ImageExtent, Pixel};
use classifier::{ActorId, SceneQuery};
use glam::{Mat4, Vec3};
use readback::{FrameRenderer, ReadbackSink};

const WALL_ACTOR: ActorId = ActorId(1000);

#[derive(Debug, Clone, Copy, PartialEq)]
struct TreeSpot {
    /// Normalized screen position of the trunk base.
    x: f32,
    y: f32,
    /// Crown radius as a fraction of the image height.
    radius: f32,
}

const TREES: [TreeSpot; 3] = [
    TreeSpot {
        x: 0.35,
        y: 0.55,
        radius: 0.08,
    },
    TreeSpot {
        x: 0.6,
        y: 0.5,
        radius: 0.06,
    },
    TreeSpot {
        x: 0.82,
        y: 0.62,
        radius: 0.1,
    },
];

#[derive(Debug, Default)]
pub struct SyntheticScene {
    frame: u64,
}

impl SyntheticScene {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameRenderer for SyntheticScene {
    fn render(&mut self, sink: &mut ReadbackSink) {
        let extent = sink.extent();
        let drift = (self.frame % 64) as f32 / 64.0 * 0.1;
        self.frame = self.frame.wrapping_add(1);
        let (raw, segmentation) = sink.buffers_mut();
        let width = extent.width as usize;
        let horizon = extent.height as f32 * 0.4;
        let wall_edge = extent.width as f32 / 6.0;

        for (index, (color, stencil)) in raw
            .pixels_mut()
            .iter_mut()
            .zip(segmentation.pixels_mut())
            .enumerate()
        {
            let x = (index % width) as f32 + 0.5;
            let y = (index / width) as f32 + 0.5;
            *stencil = Pixel::stencil(0);
            *color = if y < horizon {
                let shade = (y / horizon * 80.0) as u8;
                Pixel::opaque(110 + shade / 2, 160 + shade / 2, 235)
            } else {
                let shade = ((y - horizon) / (extent.height as f32 - horizon) * 60.0) as u8;
                Pixel::opaque(40, 120 + shade, 40)
            };

            if x < wall_edge && y >= horizon * 0.5 {
                *color = Pixel::opaque(150, 150, 145);
                *stencil = Pixel::stencil(WALL_STENCIL_ID);
                continue;
            }
            for tree in TREES {
                let center_x = (tree.x - drift) * extent.width as f32;
                let center_y = tree.y * extent.height as f32;
                let radius = tree.radius * extent.height as f32;
                let (dx, dy) = (x - center_x, y - center_y);
                if dx * dx + dy * dy <= radius * radius {
                    *color = Pixel::opaque(20, 90, 30);
                    *stencil = Pixel::stencil(TREE_STENCIL_ID);
                    break;
                }
            }
        }
    }
}

/// View-projection of the synthetic camera: 1.5 m up, looking down the -Z axis.
pub fn camera_view(extent: ImageExtent) -> CaptureView {
    let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
    let projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 200.0);
    let view = Mat4::look_at_rh(Vec3::new(0.0, 1.5, 0.0), Vec3::new(0.0, 0.5, -10.0), Vec3::Y);
    CaptureView::new(projection * view)
}

/// Fixed world layout: a row of trees ahead of the camera and a wall on the left.
#[derive(Debug, Clone)]
pub struct SyntheticSceneQuery {
    trees: Vec<Vec3>,
    wall_start: Vec3,
    wall_end: Vec3,
}

impl Default for SyntheticSceneQuery {
    fn default() -> Self {
        Self {
            trees: vec![
                Vec3::new(-2.0, 0.0, -8.0),
                Vec3::new(1.5, 0.0, -12.0),
                Vec3::new(4.0, 0.0, -6.0),
            ],
            wall_start: Vec3::new(-4.0, 0.0, -3.0),
            wall_end: Vec3::new(-4.0, 0.0, -20.0),
        }
    }
}

impl SceneQuery for SyntheticSceneQuery {
    fn find_actors_by_tag(&self, tag: &str) -> Vec<ActorId> {
        match tag {
            "Tree" => (0..self.trees.len() as u64).map(ActorId).collect(),
            "Wall" => vec![WALL_ACTOR],
            _ => Vec::new(),
        }
    }

    fn world_outline(&self, actor: ActorId) -> Vec<Vec3> {
        if actor == WALL_ACTOR {
            let up = Vec3::new(0.0, 2.0, 0.0);
            return vec![
                self.wall_start,
                self.wall_end,
                self.wall_end + up,
                self.wall_start + up,
            ];
        }
        let Some(base) = self.trees.get(actor.0 as usize) else {
            return Vec::new();
        };
        // Box around trunk and crown.
        let mut outline = Vec::with_capacity(8);
        for height in [0.0, 3.0] {
            for (dx, dz) in [(-0.6, -0.6), (0.6, -0.6), (0.6, 0.6), (-0.6, 0.6)] {
                outline.push(*base + Vec3::new(dx, height, dz));
            }
        }
        outline
    }
}

#[cfg(test)]
mod tests {
    use classifier::world_to_screen;

    use super::*;

    #[test]
    fn tree_outlines_project_into_view() {
        let extent = ImageExtent::new(320, 180);
        let view = camera_view(extent);
        let scene = SyntheticSceneQuery::default();

        for actor in scene.find_actors_by_tag("Tree") {
            let projected = scene
                .world_outline(actor)
                .into_iter()
                .filter_map(|vertex| world_to_screen(vertex, &view.view_projection, extent))
                .count();
            assert!(projected > 0, "tree {actor:?} is entirely off screen");
        }
        assert!(scene.find_actors_by_tag("Rock").is_empty());
    }
}
