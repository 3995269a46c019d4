use std::fmt;

use serde::Serialize;

/// Where a reserved job ended up after (or during) an execution attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Reserved,
    Released,
    Deleted,
    Failed,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        use JobState::*;

        match self {
            Reserved => "reserved",
            Released => "released",
            Deleted => "deleted",
            Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Lets JobInfo appear in structured (JSON/YAML) output as a bare string.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
