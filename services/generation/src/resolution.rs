//! Resolution budgeting.
//!
//! Maps a requested size onto a render size that fits a megapixel ceiling.
//! Every dimension is a multiple of the alignment unit, and the target size
//! is always the snapped request so a later upscale restores what the user
//! asked for.

use serde::Serialize;

/// Dimension granularity accepted by the diffusion engines.
pub const DEFAULT_ALIGNMENT: u32 = 64;

/// Render and target sizes for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenderPlan {
    pub render_width: u32,
    pub render_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub downscaled: bool,
}

impl RenderPlan {
    pub fn render_area(&self) -> u64 {
        u64::from(self.render_width) * u64::from(self.render_height)
    }

    pub fn target_area(&self) -> u64 {
        u64::from(self.target_width) * u64::from(self.target_height)
    }
}

/// Plans render sizes against a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionBudgeter {
    alignment: u32,
}

impl Default for ResolutionBudgeter {
    fn default() -> Self {
        Self::new(DEFAULT_ALIGNMENT)
    }
}

impl ResolutionBudgeter {
    pub fn new(alignment: u32) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Snap to the nearest multiple of the alignment unit, never below one unit.
    ///
    /// Halfway values round to the even multiple, so 800 snaps to 768.
    pub fn snap(&self, value: u32) -> u32 {
        let units = (f64::from(value) / f64::from(self.alignment)).round_ties_even();
        self.from_units(units)
    }

    fn snap_down(&self, value: u32) -> u32 {
        self.from_units((value / self.alignment) as f64)
    }

    fn from_units(&self, units: f64) -> u32 {
        let max_units = f64::from(u32::MAX / self.alignment);
        (units.clamp(1.0, max_units) as u32) * self.alignment
    }

    /// Plan a render of `width`x`height` within `ceiling_megapixels`.
    ///
    /// The render area never exceeds the ceiling as long as the ceiling covers
    /// at least one alignment block.
    pub fn plan(&self, width: u32, height: u32, ceiling_megapixels: f64) -> RenderPlan {
        let target_width = self.snap(width);
        let target_height = self.snap(height);
        let max_area = (ceiling_megapixels.max(0.0) * 1_000_000.0) as u64;
        let requested_area = u64::from(target_width) * u64::from(target_height);

        if requested_area <= max_area {
            return RenderPlan {
                render_width: target_width,
                render_height: target_height,
                target_width,
                target_height,
                downscaled: false,
            };
        }

        let scale = (max_area as f64 / requested_area as f64).sqrt();
        let scaled_width = (f64::from(target_width) * scale) as u32;
        let scaled_height = (f64::from(target_height) * scale) as u32;

        let (mut render_width, mut render_height) = (self.snap(scaled_width), self.snap(scaled_height));
        if area(render_width, render_height) > max_area {
            render_width = self.snap_down(scaled_width);
            render_height = self.snap_down(scaled_height);
        }
        while area(render_width, render_height) > max_area
            && (render_width > self.alignment || render_height > self.alignment)
        {
            if render_width >= render_height {
                render_width -= self.alignment;
            } else {
                render_height -= self.alignment;
            }
        }

        RenderPlan {
            render_width,
            render_height,
            target_width,
            target_height,
            downscaled: true,
        }
    }
}

fn area(width: u32, height: u32) -> u64 {
    u64::from(width) * u64::from(height)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: [u32; 12] = [1, 31, 64, 200, 511, 640, 768, 800, 1024, 1200, 1920, 4096];

    #[test]
    fn test_snap_rounds_to_nearest_unit() {
        let budgeter = ResolutionBudgeter::default();
        assert_eq!(budgeter.snap(0), 64);
        assert_eq!(budgeter.snap(1), 64);
        assert_eq!(budgeter.snap(95), 64);
        assert_eq!(budgeter.snap(97), 128);
        assert_eq!(budgeter.snap(800), 768);
        assert_eq!(budgeter.snap(1200), 1216);
        assert_eq!(budgeter.snap(1024), 1024);
    }

    #[test]
    fn test_within_budget_renders_at_target() {
        let budgeter = ResolutionBudgeter::default();
        for &w in &SIZES {
            for &h in &SIZES {
                let plan = budgeter.plan(w, h, 100.0);
                assert!(plan.target_area() <= 100_000_000);
                assert!(!plan.downscaled, "{w}x{h} should fit");
                assert_eq!(plan.render_width, plan.target_width);
                assert_eq!(plan.render_height, plan.target_height);
            }
        }
    }

    #[test]
    fn test_over_budget_fits_ceiling_and_keeps_target() {
        let budgeter = ResolutionBudgeter::default();
        for ceiling in [0.1, 0.25, 0.5, 1.0] {
            let max_area = (ceiling * 1_000_000.0) as u64;
            for &w in &SIZES {
                for &h in &SIZES {
                    let plan = budgeter.plan(w, h, ceiling);
                    assert_eq!(plan.target_width, budgeter.snap(w));
                    assert_eq!(plan.target_height, budgeter.snap(h));
                    assert!(plan.render_area() <= max_area, "{w}x{h} at {ceiling}MP: {plan:?}");
                    assert_eq!(plan.render_width % 64, 0);
                    assert_eq!(plan.render_height % 64, 0);
                    assert_eq!(plan.downscaled, plan.target_area() > max_area);
                }
            }
        }
    }

    #[test]
    fn test_portrait_request_under_one_megapixel() {
        let plan = ResolutionBudgeter::default().plan(800, 1200, 1.0);
        assert_eq!(
            plan,
            RenderPlan {
                render_width: 768,
                render_height: 1216,
                target_width: 768,
                target_height: 1216,
                downscaled: false,
            }
        );
    }

    #[test]
    fn test_square_request_downscaled_to_quarter_megapixel() {
        let plan = ResolutionBudgeter::default().plan(1024, 1024, 0.25);
        assert!(plan.downscaled);
        assert_eq!((plan.target_width, plan.target_height), (1024, 1024));
        assert_eq!((plan.render_width, plan.render_height), (448, 448));
    }

    #[test]
    fn test_downscale_preserves_orientation() {
        let plan = ResolutionBudgeter::default().plan(1920, 1080, 0.5);
        assert!(plan.downscaled);
        assert!(plan.render_width > plan.render_height);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let budgeter = ResolutionBudgeter::default();
        for &w in &SIZES {
            assert_eq!(budgeter.plan(w, 1000, 0.3), budgeter.plan(w, 1000, 0.3));
        }
    }

    #[test]
    fn test_custom_alignment() {
        let budgeter = ResolutionBudgeter::new(8);
        let plan = budgeter.plan(1001, 999, 1.0);
        assert_eq!((plan.target_width, plan.target_height), (1000, 1000));
        assert!(!plan.downscaled);
    }
}
