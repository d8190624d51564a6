// Domain types shared by detection, recognition, generation and quota accounting

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Axis-aligned pixel rectangle produced by contour extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// max(w/h, h/w); degenerate rectangles report infinity
    pub fn aspect_ratio(&self) -> f64 {
        if self.width == 0 || self.height == 0 {
            return f64::INFINITY;
        }
        let w = self.width as f64;
        let h = self.height as f64;
        (w / h).max(h / w)
    }

    /// Horizontal and vertical separation between closest edges, 0 when overlapping
    pub fn gaps(&self, other: &Rect) -> (u32, u32) {
        let gap_x = self.x.max(other.x).saturating_sub(self.right().min(other.right()));
        let gap_y = self.y.max(other.y).saturating_sub(self.bottom().min(other.bottom()));
        (gap_x, gap_y)
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    /// Resolution-independent form of this rectangle
    pub fn normalize(&self, image_width: u32, image_height: u32) -> Bbox {
        let w = image_width.max(1) as f64;
        let h = image_height.max(1) as f64;
        Bbox {
            x_min: (self.x as f64 / w).clamp(0.0, 1.0),
            y_min: (self.y as f64 / h).clamp(0.0, 1.0),
            x_max: (self.right() as f64 / w).clamp(0.0, 1.0),
            y_max: (self.bottom() as f64 / h).clamp(0.0, 1.0),
        }
    }
}

/// Normalized bounding box in [0, 1]²
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Bbox {
    pub fn is_valid(&self) -> bool {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        in_range(self.x_min)
            && in_range(self.y_min)
            && in_range(self.x_max)
            && in_range(self.y_max)
            && self.x_min < self.x_max
            && self.y_min < self.y_max
    }

    /// Pixel rectangle on an image of the given size, clamped to its bounds
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> Rect {
        let w = image_width as f64;
        let h = image_height as f64;
        // Absorb float noise from normalize() so round trips are exact
        const EPS: f64 = 1e-6;
        let x0 = (self.x_min * w + EPS).floor().clamp(0.0, w) as u32;
        let y0 = (self.y_min * h + EPS).floor().clamp(0.0, h) as u32;
        let x1 = (self.x_max * w - EPS).ceil().clamp(0.0, w) as u32;
        let y1 = (self.y_max * h - EPS).ceil().clamp(0.0, h) as u32;
        Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProblemType {
    MultipleChoice,
    FreeResponse,
}

/// Problem text recognized from one detected region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedProblem {
    pub bbox: Bbox,
    pub problem_type: ProblemType,
    pub problem_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<String>,
}

impl DetectedProblem {
    /// Text handed to the explanation generator
    pub fn prompt_text(&self) -> String {
        compose_problem_text(&self.problem_body, self.choices.as_deref())
    }
}

/// Problem body followed by its answer options, if any
pub fn compose_problem_text(body: &str, choices: Option<&str>) -> String {
    match choices {
        Some(choices) if !choices.trim().is_empty() => {
            format!("{}\n\n{}", body.trim(), choices.trim())
        }
        _ => body.trim().to_string(),
    }
}

/// A recognized problem together with where it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedProblem {
    pub page_number: u32,
    pub problem: DetectedProblem,
    /// PNG data URL of the cropped region
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationMode {
    Fast,
    Standard,
    Quality,
}

impl ExplanationMode {
    pub const ALL: [ExplanationMode; 3] = [Self::Fast, Self::Standard, Self::Quality];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Quality => "quality",
        }
    }

    pub fn counter(&self) -> UsageCounter {
        match self {
            Self::Fast => UsageCounter::Fast,
            Self::Standard => UsageCounter::Standard,
            Self::Quality => UsageCounter::Quality,
        }
    }
}

impl fmt::Display for ExplanationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExplanationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "quality" => Ok(Self::Quality),
            other => Err(format!("unknown explanation mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UsageTier {
    #[default]
    Free,
    Standard,
    Pro,
}

impl UsageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Pro => "pro",
        }
    }
}

/// Usage counters tracked per user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageCounter {
    Fast,
    Standard,
    Quality,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePeriod {
    Daily,
    Monthly,
}

impl UsageCounter {
    pub const ALL: [UsageCounter; 4] = [Self::Fast, Self::Standard, Self::Quality, Self::Export];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Quality => "quality",
            Self::Export => "export",
        }
    }

    pub fn period(&self) -> UsagePeriod {
        match self {
            Self::Export => UsagePeriod::Monthly,
            _ => UsagePeriod::Daily,
        }
    }
}

impl fmt::Display for UsageCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of a successful charge; refunds target the charged period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeReceipt {
    pub user_id: String,
    pub counter: UsageCounter,
    pub period: String,
    pub count: u32,
}

/// Counter values and limits for one user
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub user_id: String,
    pub tier: UsageTier,
    pub counters: Vec<CounterUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterUsage {
    pub counter: UsageCounter,
    pub period: String,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// Input to one explanation generation call
#[derive(Debug, Clone)]
pub struct ExplanationRequest {
    pub problem_text: String,
    pub problem_type: ProblemType,
    pub mode: ExplanationMode,
}

/// Output of one explanation generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub markdown: String,
    #[serde(default)]
    pub core_concepts: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<u8>,
}

/// One explanation shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationRecord {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<String>,
    pub batch_id: String,
    pub markdown: String,
    pub is_loading: bool,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub page_number: u32,
    pub problem_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub original_problem_text: String,
    pub problem_type: ProblemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<String>,
    pub mode: ExplanationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u8>,
    #[serde(default)]
    pub core_concepts: Vec<String>,
}

impl ExplanationRecord {
    pub fn is_success(&self) -> bool {
        !self.is_loading && !self.is_error
    }

    pub fn prompt_text(&self) -> String {
        compose_problem_text(&self.original_problem_text, self.choices.as_deref())
    }
}

/// A page submitted for analysis
#[derive(Clone)]
pub struct PageInput {
    pub page_number: u32,
    pub filename: String,
    pub image_bytes: Arc<Vec<u8>>,
}

impl fmt::Debug for PageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageInput")
            .field("page_number", &self.page_number)
            .field("filename", &self.filename)
            .field("bytes", &self.image_bytes.len())
            .finish()
    }
}
