use std::fmt;
use std::str::FromStr;

/// Which source frames of a time-based medium get recognised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingPolicy {
    /// Keep source frames 0, n, 2n, ...
    EveryNth(u32),
    /// Keep at most this many frames per second of media time.
    PerSecond(f64),
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::PerSecond(1.0)
    }
}

impl FromStr for SamplingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected 'fps:<rate>' or 'nth:<n>', got '{s}'"))?;

        match kind.trim().to_lowercase().as_str() {
            "fps" => {
                let rate: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| format!("invalid frame rate '{value}': {e}"))?;
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(format!("frame rate must be positive, got {rate}"));
                }
                Ok(SamplingPolicy::PerSecond(rate))
            }
            "nth" => {
                let n: u32 = value
                    .trim()
                    .parse()
                    .map_err(|e| format!("invalid frame step '{value}': {e}"))?;
                if n == 0 {
                    return Err("frame step must be at least 1".to_string());
                }
                Ok(SamplingPolicy::EveryNth(n))
            }
            other => Err(format!("unknown sampling policy '{other}'")),
        }
    }
}

impl fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingPolicy::EveryNth(n) => write!(f, "nth:{n}"),
            SamplingPolicy::PerSecond(rate) => write!(f, "fps:{rate}"),
        }
    }
}

impl SamplingPolicy {
    /// ffmpeg video filter implementing this policy.
    pub fn ffmpeg_filter(&self) -> String {
        match self {
            SamplingPolicy::EveryNth(n) => format!("select=not(mod(n\\,{n}))"),
            SamplingPolicy::PerSecond(rate) => format!("fps={rate}"),
        }
    }

    /// Whether a page of a multi-page image is kept. Pages have no media
    /// time, so a rate policy keeps them all.
    pub fn admits_page(&self, page: u64) -> bool {
        match self {
            SamplingPolicy::EveryNth(n) => page % u64::from((*n).max(1)) == 0,
            SamplingPolicy::PerSecond(_) => true,
        }
    }

    /// Timestamp of the `index`-th emitted frame, when it can be derived.
    pub fn emitted_timestamp_ms(&self, index: u32, source_fps: Option<f64>) -> Option<u64> {
        match self {
            SamplingPolicy::PerSecond(rate) => Some((index as f64 * 1000.0 / rate).round() as u64),
            SamplingPolicy::EveryNth(n) => source_fps
                .filter(|fps| *fps > 0.0)
                .map(|fps| (index as f64 * *n as f64 * 1000.0 / fps).round() as u64),
        }
    }
}

/// Stateful admission of source frames for decoders that see every frame
/// (animated images).
#[derive(Debug, Clone)]
pub struct FrameSampler {
    policy: SamplingPolicy,
    next_due_ms: f64,
}

impl FrameSampler {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            policy,
            next_due_ms: 0.0,
        }
    }

    pub fn admit(&mut self, source_index: u64, timestamp_ms: u64) -> bool {
        match self.policy {
            SamplingPolicy::EveryNth(n) => source_index % n.max(1) as u64 == 0,
            SamplingPolicy::PerSecond(rate) => {
                let t = timestamp_ms as f64;
                if t + f64::EPSILON < self.next_due_ms {
                    return false;
                }
                let interval = 1000.0 / rate;
                self.next_due_ms = ((t / interval).floor() + 1.0) * interval;
                true
            }
        }
    }
}
