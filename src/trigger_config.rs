use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdge {
    Rising,
    Falling,
    Either,
}

impl TriggerEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEdge::Rising => "rising",
            TriggerEdge::Falling => "falling",
            TriggerEdge::Either => "either",
        }
    }
}

impl fmt::Display for TriggerEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown trigger edge '{0}', expected rising, falling or either")]
pub struct UnknownTriggerEdge(pub String);

impl FromStr for TriggerEdge {
    type Err = UnknownTriggerEdge;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rising" | "posedge" | "rise" => Ok(TriggerEdge::Rising),
            "falling" | "negedge" | "fall" => Ok(TriggerEdge::Falling),
            "either" | "any" | "both" => Ok(TriggerEdge::Either),
            _ => Err(UnknownTriggerEdge(s.to_string())),
        }
    }
}

/// Digital edge condition that gates the start of recording, plus how long to
/// keep recording once the edge was seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub channel: u32,
    pub edge: TriggerEdge,
    pub after_trigger_seconds: f64,
}

impl TriggerSpec {
    pub fn new(channel: u32, edge: TriggerEdge, after_trigger_seconds: f64) -> Self {
        Self {
            channel,
            edge,
            after_trigger_seconds,
        }
    }

    /// ```rust
    /// use logic_automation::trigger_config::{TriggerEdge, TriggerSpec};
    ///
    /// let trigger = TriggerSpec::start_capturing_when()
    ///     .channel(3)
    ///     .rising_edge()
    ///     .then_record_for(0.25);
    /// assert_eq!(trigger, TriggerSpec::new(3, TriggerEdge::Rising, 0.25));
    /// ```
    pub fn start_capturing_when() -> EdgeTriggerBuilder {
        EdgeTriggerBuilder::new()
    }

    pub fn after_trigger(&self) -> Duration {
        crate::config::secs(self.after_trigger_seconds)
    }
}

#[derive(Debug)]
pub struct EdgeTriggerBuilder {
    channel: u32,
    edge: TriggerEdge,
}

impl EdgeTriggerBuilder {
    pub fn new() -> Self {
        Self {
            channel: 0,
            edge: TriggerEdge::Rising,
        }
    }

    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    pub fn rising_edge(mut self) -> Self {
        self.edge = TriggerEdge::Rising;
        self
    }

    pub fn falling_edge(mut self) -> Self {
        self.edge = TriggerEdge::Falling;
        self
    }

    /// Fires on the first transition in either direction.
    pub fn either_edge(mut self) -> Self {
        self.edge = TriggerEdge::Either;
        self
    }

    pub fn then_record_for(self, seconds: f64) -> TriggerSpec {
        TriggerSpec::new(self.channel, self.edge, seconds)
    }
}

impl Default for EdgeTriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
