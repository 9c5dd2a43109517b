use crate::error::TransferError;
use serde::{Deserialize, Serialize};

/// Control frames sent as text messages around a file's binary payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Precedes the payload and declares its exact length
    Meta { name: String, size: u64 },
    /// Trailing marker after the last chunk
    Done,
    /// Any other `type`; receivers ignore it
    #[serde(other)]
    Unknown,
}

impl ControlFrame {
    pub fn meta(name: impl Into<String>, size: u64) -> Self {
        ControlFrame::Meta {
            name: name.into(),
            size,
        }
    }

    pub fn encode(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_round_trip() {
        let frame = ControlFrame::meta("report.pdf", 52_428_800);
        let text = frame.encode().unwrap();
        assert_eq!(ControlFrame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_wire_format() {
        let text = ControlFrame::meta("a.txt", 3).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, serde_json::json!({"type": "meta", "name": "a.txt", "size": 3}));
        assert_eq!(ControlFrame::Done.encode().unwrap(), r#"{"type":"done"}"#);
    }

    #[test]
    fn test_decode_browser_frames() {
        assert_eq!(
            ControlFrame::decode(r#"{"type":"meta","name":"photo.jpg","size":0}"#).unwrap(),
            ControlFrame::meta("photo.jpg", 0)
        );
        assert_eq!(
            ControlFrame::decode(r#"{"type":"done"}"#).unwrap(),
            ControlFrame::Done
        );
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        assert_eq!(
            ControlFrame::decode(r#"{"type":"progress","percent":50}"#).unwrap(),
            ControlFrame::Unknown
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(ControlFrame::decode("not json").is_err());
        assert!(ControlFrame::decode(r#"{"type":"meta","name":"x","size":-1}"#).is_err());
        assert!(ControlFrame::decode(r#"{"type":"meta","size":10}"#).is_err());
    }
}
