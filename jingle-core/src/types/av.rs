use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio/video capability set for one direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AvFlags {
    pub audio: bool,
    pub video: bool,
}

impl AvFlags {
    pub const NONE: AvFlags = AvFlags::new(false, false);
    pub const AUDIO: AvFlags = AvFlags::new(true, false);
    pub const VIDEO: AvFlags = AvFlags::new(false, true);
    pub const AUDIO_VIDEO: AvFlags = AvFlags::new(true, true);

    pub const fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }

    pub fn any(&self) -> bool {
        self.audio || self.video
    }

    pub fn intersect(&self, other: AvFlags) -> AvFlags {
        AvFlags::new(self.audio && other.audio, self.video && other.video)
    }

    pub fn union(&self, other: AvFlags) -> AvFlags {
        AvFlags::new(self.audio || other.audio, self.video || other.video)
    }

    /// Media attribute value: `a`, `v`, `av`, or `_` for nothing.
    pub fn to_wire(&self) -> &'static str {
        match (self.audio, self.video) {
            (true, true) => "av",
            (true, false) => "a",
            (false, true) => "v",
            (false, false) => "_",
        }
    }

    /// Lenient: unknown characters are ignored.
    pub fn from_wire(s: &str) -> AvFlags {
        AvFlags::new(s.contains('a'), s.contains('v'))
    }
}

impl fmt::Display for AvFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_wire())
    }
}
