//! Output stream capabilities
//!
//! Describes what the producer emits: an H.264 byte-stream, one access unit
//! per buffer, at the session's frame size. Before a session exists only
//! the template ranges are known.

use crate::config::H264Profile;
use crate::types::{Framerate, Resolution};
use std::cmp::Ordering;
use std::fmt;

/// Framerate the producer settles on when downstream leaves it open
pub const PREFERRED_FRAMERATE: Framerate = Framerate::FPS_25;

const FRACTION_MAX: u32 = i32::MAX as u32;

fn compare(a: Framerate, b: Framerate) -> Ordering {
    (a.num as u64 * b.den as u64).cmp(&(b.num as u64 * a.den as u64))
}

/// Inclusive framerate range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerateRange {
    pub min: Framerate,
    pub max: Framerate,
}

impl FramerateRange {
    /// Every framerate, including 0/1
    pub const ANY: Self = Self {
        min: Framerate::new(0, 1),
        max: Framerate::new(FRACTION_MAX, 1),
    };

    /// Every usable framerate
    pub const POSITIVE: Self = Self {
        min: Framerate::new(1, FRACTION_MAX),
        max: Framerate::new(FRACTION_MAX, 1),
    };

    pub fn new(min: Framerate, max: Framerate) -> Self {
        Self { min, max }
    }

    /// A range holding exactly one rate
    pub fn fixed(rate: Framerate) -> Self {
        Self::new(rate, rate)
    }

    pub fn is_fixed(&self) -> bool {
        compare(self.min, self.max) == Ordering::Equal
    }

    pub fn contains(&self, rate: Framerate) -> bool {
        compare(rate, self.min) != Ordering::Less && compare(rate, self.max) != Ordering::Greater
    }

    pub fn intersect(&self, other: &FramerateRange) -> Option<FramerateRange> {
        let min = if compare(self.min, other.min) == Ordering::Less {
            other.min
        } else {
            self.min
        };
        let max = if compare(self.max, other.max) == Ordering::Greater {
            other.max
        } else {
            self.max
        };
        (compare(min, max) != Ordering::Greater).then_some(Self::new(min, max))
    }

    /// The rate in the range closest to `target`
    pub fn fixate_nearest(&self, target: Framerate) -> Framerate {
        if compare(target, self.min) == Ordering::Less {
            self.min
        } else if compare(target, self.max) == Ordering::Greater {
            self.max
        } else {
            target
        }
    }

    /// The rate in the range closest to [`PREFERRED_FRAMERATE`]
    pub fn fixate(&self) -> Framerate {
        self.fixate_nearest(PREFERRED_FRAMERATE)
    }
}

impl fmt::Display for FramerateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fixed() {
            write!(f, "{}/{}", self.min.num, self.min.den)
        } else {
            write!(
                f,
                "[ {}/{}, {}/{} ]",
                self.min.num, self.min.den, self.max.num, self.max.den
            )
        }
    }
}

/// A fixed value or an inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Fixed(u32),
    Range(u32, u32),
}

impl Dimension {
    pub fn contains(&self, value: u32) -> bool {
        match *self {
            Dimension::Fixed(v) => v == value,
            Dimension::Range(min, max) => (min..=max).contains(&value),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(v) => write!(f, "{}", v),
            Dimension::Range(min, max) => write!(f, "[ {}, {} ]", min, max),
        }
    }
}

/// Capabilities of the encoded output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCaps {
    pub width: Dimension,
    pub height: Dimension,
    pub framerate: FramerateRange,
    pub profiles: Vec<H264Profile>,
}

impl OutputCaps {
    pub const MEDIA_TYPE: &'static str = "video/x-h264";
    pub const STREAM_FORMAT: &'static str = "byte-stream";
    pub const ALIGNMENT: &'static str = "au";

    /// Everything the producer could ever emit
    pub fn template() -> Self {
        Self {
            width: Dimension::Range(145, 4096),
            height: Dimension::Range(49, 4095),
            framerate: FramerateRange::ANY,
            profiles: vec![
                H264Profile::Main,
                H264Profile::High,
                H264Profile::High444,
                H264Profile::Baseline,
            ],
        }
    }

    /// What an open session emits
    pub fn for_session(size: Resolution, profile: H264Profile) -> Self {
        Self {
            width: Dimension::Fixed(size.width),
            height: Dimension::Fixed(size.height),
            framerate: FramerateRange::POSITIVE,
            profiles: vec![profile],
        }
    }

    pub fn accepts(&self, size: Resolution, framerate: Framerate) -> bool {
        self.width.contains(size.width)
            && self.height.contains(size.height)
            && self.framerate.contains(framerate)
    }
}

impl fmt::Display for OutputCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, width=(int){}, height=(int){}, framerate=(fraction){}, \
             stream-format=(string){}, alignment=(string){}, profile=(string)",
            Self::MEDIA_TYPE,
            self.width,
            self.height,
            self.framerate,
            Self::STREAM_FORMAT,
            Self::ALIGNMENT
        )?;
        match self.profiles.as_slice() {
            [single] => write!(f, "{}", single.as_str()),
            profiles => {
                let names: Vec<_> = profiles.iter().map(|p| p.as_str()).collect();
                write!(f, "{{ {} }}", names.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixate_prefers_25() {
        assert_eq!(FramerateRange::ANY.fixate(), Framerate::FPS_25);
        assert_eq!(FramerateRange::POSITIVE.fixate(), Framerate::FPS_25);

        let high = FramerateRange::new(Framerate::FPS_30, Framerate::FPS_60);
        assert_eq!(high.fixate(), Framerate::FPS_30);

        let low = FramerateRange::new(Framerate::new(5, 1), Framerate::new(15, 1));
        assert_eq!(low.fixate(), Framerate::new(15, 1));

        let ntsc = FramerateRange::fixed(Framerate::new(30000, 1001));
        assert_eq!(ntsc.fixate(), Framerate::new(30000, 1001));
    }

    #[test]
    fn test_intersect() {
        let downstream = FramerateRange::new(Framerate::new(10, 1), Framerate::FPS_30);
        let both = FramerateRange::POSITIVE.intersect(&downstream).unwrap();
        assert_eq!(both, downstream);

        let disjoint = FramerateRange::new(Framerate::FPS_60, Framerate::new(120, 1));
        assert!(downstream.intersect(&disjoint).is_none());

        // 50/2 and 25/1 are the same rate
        let fixed = FramerateRange::fixed(Framerate::new(50, 2));
        assert!(fixed.is_fixed());
        assert!(FramerateRange::fixed(Framerate::FPS_25)
            .intersect(&fixed)
            .is_some());
    }

    #[test]
    fn test_template_and_session_caps() {
        let template = OutputCaps::template();
        assert!(template.accepts(Resolution::FHD_1080P, Framerate::FPS_60));
        assert!(!template.accepts(Resolution::new(100, 100), Framerate::FPS_60));
        assert!(template.framerate.contains(Framerate::new(0, 1)));

        let session = OutputCaps::for_session(Resolution::new(1368, 768), H264Profile::High);
        assert!(session.accepts(Resolution::new(1368, 768), Framerate::FPS_25));
        assert!(!session.accepts(Resolution::new(1366, 768), Framerate::FPS_25));
        assert!(!session.framerate.contains(Framerate::new(0, 1)));
    }

    #[test]
    fn test_caps_string() {
        let caps = OutputCaps::for_session(Resolution::HD_720P, H264Profile::High);
        assert_eq!(
            caps.to_string(),
            "video/x-h264, width=(int)1280, height=(int)720, \
             framerate=(fraction)[ 1/2147483647, 2147483647/1 ], \
             stream-format=(string)byte-stream, alignment=(string)au, profile=(string)high"
        );
        assert!(OutputCaps::template()
            .to_string()
            .ends_with("profile=(string){ main, high, high-4:4:4, baseline }"));
    }
}
