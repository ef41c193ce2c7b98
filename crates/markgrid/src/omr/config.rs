//! Decode configuration.

/// Expected anchor-disc diameter range in image pixels.
///
/// The processor derives its blob-candidate area gates from this range. A
/// single known size can be expressed by setting `diameter_min_px ==
/// diameter_max_px`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct AnchorScalePrior {
    /// Minimum expected anchor diameter in pixels.
    pub diameter_min_px: f32,
    /// Maximum expected anchor diameter in pixels.
    pub diameter_max_px: f32,
}

impl AnchorScalePrior {
    const MIN_DIAMETER_FLOOR_PX: f32 = 4.0;

    /// Construct a prior from a diameter range in pixels.
    pub fn new(diameter_min_px: f32, diameter_max_px: f32) -> Self {
        let mut out = Self {
            diameter_min_px,
            diameter_max_px,
        };
        out.normalize_in_place();
        out
    }

    /// Construct a fixed-size prior from one diameter hint.
    pub fn from_nominal_diameter_px(diameter_px: f32) -> Self {
        Self::new(diameter_px, diameter_px)
    }

    /// Return the normalized diameter range `[min, max]` in pixels.
    pub fn diameter_range_px(self) -> [f32; 2] {
        let n = self.normalized();
        [n.diameter_min_px, n.diameter_max_px]
    }

    /// Nominal diameter (midpoint of `[min, max]`) in pixels.
    pub fn nominal_diameter_px(self) -> f32 {
        let [d_min, d_max] = self.diameter_range_px();
        0.5 * (d_min + d_max)
    }

    /// Return a normalized copy with finite, ordered, non-degenerate bounds.
    pub fn normalized(self) -> Self {
        let mut out = self;
        out.normalize_in_place();
        out
    }

    fn normalize_in_place(&mut self) {
        let defaults = AnchorScalePrior::default();
        let mut d_min = if self.diameter_min_px.is_finite() {
            self.diameter_min_px
        } else {
            defaults.diameter_min_px
        };
        let mut d_max = if self.diameter_max_px.is_finite() {
            self.diameter_max_px
        } else {
            defaults.diameter_max_px
        };
        if d_min > d_max {
            std::mem::swap(&mut d_min, &mut d_max);
        }
        d_min = d_min.max(Self::MIN_DIAMETER_FLOOR_PX);
        d_max = d_max.max(d_min);
        self.diameter_min_px = d_min;
        self.diameter_max_px = d_max;
    }
}

impl Default for AnchorScalePrior {
    fn default() -> Self {
        // 7mm anchor discs scanned anywhere between ~50 and 600 dpi.
        Self {
            diameter_min_px: 12.0,
            diameter_max_px: 168.0,
        }
    }
}

/// Anchor registration controls.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Anchor diameter search range in pixels.
    pub anchor_scale: AnchorScalePrior,
    /// Pixels darker than `mean * dark_fraction` count as candidate ink
    /// during the anchor scan.
    pub dark_fraction: f32,
    /// Minimum blob fill of its bounding box (a disc scores ~0.78).
    pub min_blob_fill: f32,
    /// Maximum blob bounding-box aspect ratio (long/short side).
    pub max_blob_aspect: f32,
    /// Maximum normalized-position distance when matching a blob to a
    /// template anchor (fraction of the page diagonal).
    pub max_match_distance: f32,
    /// Minimum alignment confidence in [0, 1]; below this the sheet is
    /// rejected as unregisterable.
    pub min_alignment_confidence: f32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            anchor_scale: AnchorScalePrior::default(),
            dark_fraction: 0.6,
            min_blob_fill: 0.55,
            max_blob_aspect: 1.6,
            max_match_distance: 0.18,
            min_alignment_confidence: 0.5,
        }
    }
}

/// Bubble sampling controls.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sample lattice step inside a bubble, as a fraction of its radius.
    pub step_fraction: f32,
    /// Background annulus around a bubble, inner edge (fraction of radius).
    pub annulus_inner: f32,
    /// Background annulus outer edge (fraction of radius).
    pub annulus_outer: f32,
    /// A sample counts as ink when darker than `background * ink_contrast`.
    pub ink_contrast: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            step_fraction: 0.22,
            annulus_inner: 1.5,
            annulus_outer: 2.2,
            ink_contrast: 0.65,
        }
    }
}

/// Top-level decode configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OmrConfig {
    /// Anchor registration controls.
    pub registration: RegistrationConfig,
    /// Bubble sampling controls.
    pub sampling: SamplingConfig,
    /// Fill ratio at or above which an option reads as marked.
    pub high_threshold: f32,
    /// Fill ratio at or below which an option reads as unmarked.
    pub low_threshold: f32,
    /// Minimum fill-ratio separation between the top two candidates of a
    /// question before the darker one may win outright.
    pub min_margin_between_options: f32,
}

impl OmrConfig {
    /// Build a configuration with anchor-scale-dependent parameters derived
    /// from a diameter range. Individual fields can be overridden after.
    pub fn from_anchor_scale_prior(anchor_scale: AnchorScalePrior) -> Self {
        let mut cfg = Self::default();
        cfg.set_anchor_scale_prior(anchor_scale);
        cfg
    }

    /// Update the anchor scale prior, re-normalizing its bounds.
    pub fn set_anchor_scale_prior(&mut self, anchor_scale: AnchorScalePrior) {
        self.registration.anchor_scale = anchor_scale.normalized();
    }

    /// Clamp thresholds into a usable order: `0 <= low < high <= 1`.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.high_threshold = out.high_threshold.clamp(0.0, 1.0);
        out.low_threshold = out.low_threshold.clamp(0.0, out.high_threshold);
        if out.low_threshold >= out.high_threshold {
            let defaults = OmrConfig::default();
            out.low_threshold = defaults.low_threshold;
            out.high_threshold = defaults.high_threshold;
        }
        out.min_margin_between_options = out.min_margin_between_options.clamp(0.0, 1.0);
        out.registration.anchor_scale = out.registration.anchor_scale.normalized();
        out
    }
}

impl Default for OmrConfig {
    fn default() -> Self {
        Self {
            registration: RegistrationConfig::default(),
            sampling: SamplingConfig::default(),
            high_threshold: 0.55,
            low_threshold: 0.25,
            min_margin_between_options: 0.2,
        }
    }
}
