//! Input event wire format
//!
//! One JSON object per event on the data channel, no response expected:
//!
//! ```text
//! {"type":"click","x":120,"y":48}
//! {"type":"scroll","deltaY":-3}
//! {"type":"text","text":"hello"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Discrete user action relayed to the remote session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputEvent {
    /// Pointer click at integer pixel coordinates
    Click { x: i32, y: i32 },
    /// Vertical scroll delta
    Scroll {
        #[serde(rename = "deltaY")]
        delta_y: i32,
    },
    /// Text entry
    Text { text: String },
}

impl InputEvent {
    /// Click at fractional coordinates, rounded to the nearest pixel
    pub fn click(x: f64, y: f64) -> Self {
        Self::Click {
            x: round_to_i32(x),
            y: round_to_i32(y),
        }
    }

    pub fn scroll(delta_y: f64) -> Self {
        Self::Scroll {
            delta_y: round_to_i32(delta_y),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::Text { .. } => "text",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Saturating round; NaN maps to 0
fn round_to_i32(value: f64) -> i32 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}
