//! The JSON body returned in place of a failed API call.

use serde::{Deserialize, Serialize};

use crate::http::{Response, StatusCode};

/// Value of the `error` field in every offline envelope.
pub const OFFLINE_ERROR: &str = "offline";

/// `{"ok":false,"error":"offline","note":"…"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineEnvelope {
    pub ok: bool,
    pub error: String,
    pub note: String,
}

impl OfflineEnvelope {
    pub fn new(note: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: OFFLINE_ERROR.to_owned(),
            note: note.into(),
        }
    }

    /// Renders the envelope as a `200 OK` JSON response.
    pub fn into_response(self) -> Result<Response, serde_json::Error> {
        Response::json(StatusCode::Ok, &self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let response = OfflineEnvelope::new("API 請求無法離線")
            .into_response()
            .unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(
            response.headers().get("content-type"),
            Some("application/json")
        );
        let value: serde_json::Value = serde_json::from_slice(response.content()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "ok": false, "error": "offline", "note": "API 請求無法離線" })
        );
    }
}
