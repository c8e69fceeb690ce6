//! HTTP(S) snapshot source.
//!
//! Issues one GET per capture against the camera's still-image URL, with
//! optional basic auth, a hard deadline, and status/content-type checks.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;

use super::{CaptureError, CapturedFrame, FrameSource};
use crate::clock::Clock;
use crate::model::CameraSource;

const MAX_REDIRECTS: u32 = 5;

pub struct HttpFrameSource {
    agent: ureq::Agent,
    clock: Arc<dyn Clock>,
    max_frame_bytes: usize,
}

impl HttpFrameSource {
    pub fn new(timeout: Duration, max_frame_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(MAX_REDIRECTS)
            .build();
        Self {
            agent,
            clock,
            max_frame_bytes,
        }
    }
}

impl FrameSource for HttpFrameSource {
    fn capture(&self, source: &CameraSource) -> Result<CapturedFrame, CaptureError> {
        let mut request = self.agent.get(&source.url);
        if let Some((user, pass)) = source.credentials() {
            request = request.set("Authorization", &basic_auth_header(user, pass));
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(CaptureError::InvalidResponse(format!(
                    "http status {}",
                    code
                )))
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(CaptureError::Fetch(transport.to_string()))
            }
        };

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(CaptureError::InvalidResponse(format!(
                "http status {}",
                status
            )));
        }

        let content_type = response.header("Content-Type").unwrap_or("").to_string();
        if !is_image_content_type(&content_type) {
            return Err(CaptureError::InvalidResponse(format!(
                "unexpected content type '{}'",
                content_type
            )));
        }

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(self.max_frame_bytes as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| CaptureError::Fetch(format!("read frame body: {}", e)))?;
        if bytes.is_empty() {
            return Err(CaptureError::InvalidResponse("empty frame body".to_string()));
        }
        if bytes.len() > self.max_frame_bytes {
            return Err(CaptureError::InvalidResponse(format!(
                "frame exceeds {} bytes",
                self.max_frame_bytes
            )));
        }

        Ok(CapturedFrame {
            bytes,
            content_type,
            captured_at: self.clock.now_ms(),
        })
    }
}

fn basic_auth_header(user: &str, pass: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
    format!("Basic {}", encoded)
}

fn is_image_content_type(value: &str) -> bool {
    value.trim_start().to_ascii_lowercase().starts_with("image/")
}
