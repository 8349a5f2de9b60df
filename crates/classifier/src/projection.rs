use capture_config::OverlayConfig;
use capture_protocol::{ImageExtent, Pixel, PixelBuffer};
use glam::{Mat4, Vec2, Vec3};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u64);

/// World lookup used by the projection overlay.
pub trait SceneQuery: Send + Sync {
    fn find_actors_by_tag(&self, tag: &str) -> Vec<ActorId>;

    /// World-space outline vertices of the actor's bounds.
    fn world_outline(&self, actor: ActorId) -> Vec<Vec3>;
}

/// Projects a world point to pixel coordinates of `extent`.
///
/// Returns `None` for points behind the camera or outside the view frustum.
pub fn world_to_screen(point: Vec3, view_projection: &Mat4, extent: ImageExtent) -> Option<Vec2> {
    let clip = *view_projection * point.extend(1.0);
    if clip.w <= f32::EPSILON {
        return None;
    }
    let ndc = clip.truncate() / clip.w;
    if !(-1.0..=1.0).contains(&ndc.x) || !(-1.0..=1.0).contains(&ndc.y) {
        return None;
    }
    if !(0.0..=1.0).contains(&ndc.z) {
        return None;
    }
    Some(Vec2::new(
        (ndc.x + 1.0) * 0.5 * extent.width as f32,
        (1.0 - ndc.y) * 0.5 * extent.height as f32,
    ))
}

/// Linear blend of `tint` over `base`. The base alpha is kept.
pub fn blend_over(base: Pixel, tint: Pixel, alpha: f32) -> Pixel {
    let alpha = alpha.clamp(0.0, 1.0);
    let mix = |from: u8, to: u8| -> u8 {
        let from = f32::from(from);
        (from + (f32::from(to) - from) * alpha).round().clamp(0.0, 255.0) as u8
    };
    Pixel::new(
        mix(base.r, tint.r),
        mix(base.g, tint.g),
        mix(base.b, tint.b),
        base.a,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverlayReport {
    pub actors: usize,
    pub projected_points: usize,
    pub dropped_points: usize,
    pub stamped_pixels: usize,
}

/// Debug overlay stamping tagged actors' projected outlines as translucent discs.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionOverlay {
    tags: Vec<String>,
    radius: u32,
    tint: Pixel,
    alpha: f32,
}

impl ProjectionOverlay {
    pub fn new(tags: Vec<String>, radius: u32, tint: Pixel, alpha: f32) -> Self {
        Self {
            tags,
            radius,
            tint,
            alpha,
        }
    }

    pub fn from_config(config: &OverlayConfig) -> Self {
        Self::new(config.tags.clone(), config.radius, Pixel::RED, config.alpha)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn apply(
        &self,
        scene: &dyn SceneQuery,
        view_projection: &Mat4,
        output: &mut PixelBuffer,
    ) -> OverlayReport {
        let extent = output.extent();
        let actors: Vec<ActorId> = self
            .tags
            .iter()
            .flat_map(|tag| scene.find_actors_by_tag(tag))
            .collect();

        // (projected centers, dropped vertex count) per actor
        let projected: Vec<(Vec<Vec2>, usize)> = actors
            .par_iter()
            .map(|actor| {
                let outline = scene.world_outline(*actor);
                let total = outline.len();
                let points: Vec<Vec2> = outline
                    .into_iter()
                    .filter_map(|vertex| world_to_screen(vertex, view_projection, extent))
                    .collect();
                let dropped = total - points.len();
                (points, dropped)
            })
            .collect();

        let mut report = OverlayReport {
            actors: actors.len(),
            ..OverlayReport::default()
        };
        for (points, dropped) in projected {
            report.dropped_points += dropped;
            report.projected_points += points.len();
            for center in points {
                report.stamped_pixels += self.stamp_disc(output, center);
            }
        }
        tracing::trace!(?report, "projection overlay applied");
        report
    }

    /// Blends a disc of `radius` around `center`. Pixels outside the image are skipped.
    pub fn stamp_disc(&self, output: &mut PixelBuffer, center: Vec2) -> usize {
        let extent = output.extent();
        let center_x = center.x.floor() as i64;
        let center_y = center.y.floor() as i64;
        let radius = i64::from(self.radius);
        let mut stamped = 0;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius * radius {
                    continue;
                }
                let (x, y) = (center_x + dx, center_y + dy);
                if !extent.contains(x, y) {
                    continue;
                }
                let index = y as usize * extent.width as usize + x as usize;
                let pixel = &mut output.pixels_mut()[index];
                *pixel = blend_over(*pixel, self.tint, self.alpha);
                stamped += 1;
            }
        }
        stamped
    }
}
