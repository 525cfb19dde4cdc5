//! WebDriver-style wire client.
//!
//! Two HTTP clients with different timeouts: agent response times are
//! bimodal, so gestures and lifecycle calls get 10 s while screenshots and
//! element searches get 60 s.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{AgentError, AppRunState, HardwareButton, Strategy};

const GESTURE_TIMEOUT: Duration = Duration::from_secs(10);
const HEAVY_TIMEOUT: Duration = Duration::from_secs(60);

/// Cached screen geometry, captured once per automation session.
#[derive(Debug, Clone, Copy)]
pub struct ScreenSize {
    pub width: f64,
    pub height: f64,
}

/// Opaque element handle returned by lookups.
#[derive(Debug, Clone)]
pub struct ElementRef(pub String);

/// Client bound to one device's automation endpoint.
#[derive(Clone)]
pub struct AgentClient {
    base: String,
    gesture: reqwest::Client,
    heavy: reqwest::Client,
}

#[derive(Deserialize)]
struct WireValue<T> {
    value: T,
}

fn element_id(value: &serde_json::Value) -> Option<String> {
    // Both the legacy "ELEMENT" key and the W3C element identifier appear in
    // the wild depending on agent version.
    value
        .get("ELEMENT")
        .or_else(|| value.get("element-6066-11e4-a52e-4f735466cecf"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

impl AgentClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base: format!("http://{}:{}", host, port),
            gesture: reqwest::Client::builder()
                .timeout(GESTURE_TIMEOUT)
                .build()
                .expect("reqwest client"),
            heavy: reqwest::Client::builder()
                .timeout(HEAVY_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Health probe: 200 iff the agent is responsive and holds the device.
    pub async fn status(&self) -> Result<(), AgentError> {
        let resp = self
            .gesture
            .get(format!("{}/status", self.base))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    /// Begin an automation session and cache screen geometry.
    pub async fn create_session(&self) -> Result<AgentSession, AgentError> {
        let resp = self
            .heavy
            .post(format!("{}/session", self.base))
            .json(&json!({"capabilities": {}}))
            .send()
            .await?;
        check_status(&resp)?;
        let body: serde_json::Value = resp.json().await?;
        let session_id = body["value"]["sessionId"]
            .as_str()
            .or_else(|| body["sessionId"].as_str())
            .ok_or_else(|| AgentError::Protocol("missing sessionId".into()))?
            .to_string();

        let rect = self
            .gesture
            .get(format!("{}/session/{}/window/rect", self.base, session_id))
            .send()
            .await?;
        check_status(&rect)?;
        let rect: WireValue<serde_json::Value> = rect.json().await?;
        let screen = ScreenSize {
            width: rect.value["width"].as_f64().unwrap_or(390.0),
            height: rect.value["height"].as_f64().unwrap_or(844.0),
        };

        Ok(AgentSession {
            client: self.clone(),
            id: session_id,
            screen,
        })
    }
}

/// One automation session on one device.
pub struct AgentSession {
    client: AgentClient,
    id: String,
    pub screen: ScreenSize,
}

impl AgentSession {
    fn url(&self, suffix: &str) -> String {
        format!("{}/session/{}{}", self.client.base, self.id, suffix)
    }

    /// End the session. Errors are reported but not fatal; the next session
    /// creation supersedes a leaked one.
    pub async fn close(self) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .delete(format!("{}/session/{}", self.client.base, self.id))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    /// Raw PNG bytes, used for CAPTCHA solving.
    pub async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        let resp = self
            .client
            .heavy
            .post(self.url("/screenshot"))
            .send()
            .await?;
        check_status(&resp)?;
        let body: WireValue<String> = resp.json().await?;
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(body.value.trim())
            .map_err(|_| AgentError::Protocol("screenshot is not base64 PNG".into()))
    }

    /// Look up a single element by one strategy.
    pub async fn find_element(
        &self,
        strategy: Strategy,
        selector: &str,
    ) -> Result<ElementRef, AgentError> {
        let resp = self
            .client
            .heavy
            .post(self.url("/element"))
            .json(&json!({"using": strategy.wire_name(), "value": selector}))
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Err(AgentError::ElementNotFound(selector.to_string()));
        }
        check_status(&resp)?;
        let body: WireValue<serde_json::Value> = resp.json().await?;
        element_id(&body.value)
            .map(ElementRef)
            .ok_or_else(|| AgentError::ElementNotFound(selector.to_string()))
    }

    /// Try lookups in preferred-strategy order, returning the first hit.
    pub async fn find_first(
        &self,
        candidates: &[(Strategy, &str)],
    ) -> Result<ElementRef, AgentError> {
        for (strategy, selector) in candidates {
            match self.find_element(*strategy, selector).await {
                Ok(element) => return Ok(element),
                Err(AgentError::ElementNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AgentError::ElementNotFound(
            candidates
                .iter()
                .map(|(_, s)| *s)
                .collect::<Vec<_>>()
                .join(" | "),
        ))
    }

    pub async fn click(&self, element: &ElementRef) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url(&format!("/element/{}/click", element.0)))
            .json(&json!({}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    pub async fn set_value(&self, element: &ElementRef, text: &str) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url(&format!("/element/{}/value", element.0)))
            .json(&json!({"text": text}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    /// Single tap at screen coordinates via W3C actions.
    pub async fn tap(&self, x: f64, y: f64) -> Result<(), AgentError> {
        self.perform_pointer_actions(json!([
            {"type": "pointerMove", "duration": 0, "x": x, "y": y},
            {"type": "pointerDown", "button": 0},
            {"type": "pause", "duration": 60},
            {"type": "pointerUp", "button": 0}
        ]))
        .await
    }

    /// Touch-and-hold, used for the home-screen app removal flow.
    pub async fn long_press(&self, x: f64, y: f64, hold: Duration) -> Result<(), AgentError> {
        self.perform_pointer_actions(json!([
            {"type": "pointerMove", "duration": 0, "x": x, "y": y},
            {"type": "pointerDown", "button": 0},
            {"type": "pause", "duration": hold.as_millis() as u64},
            {"type": "pointerUp", "button": 0}
        ]))
        .await
    }

    /// On-screen rectangle of an element: (x, y, width, height).
    pub async fn element_rect(
        &self,
        element: &ElementRef,
    ) -> Result<(f64, f64, f64, f64), AgentError> {
        let resp = self
            .client
            .gesture
            .get(self.url(&format!("/element/{}/rect", element.0)))
            .send()
            .await?;
        check_status(&resp)?;
        let body: WireValue<serde_json::Value> = resp.json().await?;
        Ok((
            body.value["x"].as_f64().unwrap_or(0.0),
            body.value["y"].as_f64().unwrap_or(0.0),
            body.value["width"].as_f64().unwrap_or(0.0),
            body.value["height"].as_f64().unwrap_or(0.0),
        ))
    }

    pub async fn double_tap(&self, x: f64, y: f64) -> Result<(), AgentError> {
        self.perform_pointer_actions(json!([
            {"type": "pointerMove", "duration": 0, "x": x, "y": y},
            {"type": "pointerDown", "button": 0},
            {"type": "pause", "duration": 50},
            {"type": "pointerUp", "button": 0},
            {"type": "pause", "duration": 80},
            {"type": "pointerDown", "button": 0},
            {"type": "pause", "duration": 50},
            {"type": "pointerUp", "button": 0}
        ]))
        .await
    }

    /// Finger swipe between two points over `duration`.
    pub async fn swipe(
        &self,
        from: (f64, f64),
        to: (f64, f64),
        duration: Duration,
    ) -> Result<(), AgentError> {
        self.perform_pointer_actions(json!([
            {"type": "pointerMove", "duration": 0, "x": from.0, "y": from.1},
            {"type": "pointerDown", "button": 0},
            {"type": "pointerMove", "duration": duration.as_millis() as u64, "x": to.0, "y": to.1},
            {"type": "pointerUp", "button": 0}
        ]))
        .await
    }

    async fn perform_pointer_actions(
        &self,
        actions: serde_json::Value,
    ) -> Result<(), AgentError> {
        let payload = json!({
            "actions": [{
                "type": "pointer",
                "id": "finger1",
                "parameters": {"pointerType": "touch"},
                "actions": actions
            }]
        });
        let resp = self
            .client
            .gesture
            .post(self.url("/actions"))
            .json(&payload)
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    // ── App lifecycle ────────────────────────────────────────────────────

    pub async fn activate_app(&self, bundle_id: &str) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url("/wda/apps/activate"))
            .json(&json!({"bundleId": bundle_id}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    pub async fn terminate_app(&self, bundle_id: &str) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url("/wda/apps/terminate"))
            .json(&json!({"bundleId": bundle_id}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    pub async fn app_state(&self, bundle_id: &str) -> Result<AppRunState, AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url("/wda/apps/state"))
            .json(&json!({"bundleId": bundle_id}))
            .send()
            .await?;
        check_status(&resp)?;
        let body: WireValue<i64> = resp.json().await?;
        AppRunState::from_code(body.value)
            .ok_or_else(|| AgentError::Protocol(format!("app state code {}", body.value)))
    }

    // ── System alerts ────────────────────────────────────────────────────

    /// Lightweight probe: the current alert's text, or None when no alert is
    /// showing. This is the only alert check warmers are allowed in tight
    /// loops; full tree reads are too slow and too identifiable.
    pub async fn alert_text(&self) -> Result<Option<String>, AgentError> {
        let resp = self
            .client
            .gesture
            .get(self.url("/alert/text"))
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        check_status(&resp)?;
        let body: WireValue<serde_json::Value> = resp.json().await?;
        Ok(body.value.as_str().map(|s| s.to_string()))
    }

    pub async fn accept_alert(&self) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url("/alert/accept"))
            .json(&json!({}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    pub async fn dismiss_alert(&self) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url("/alert/dismiss"))
            .json(&json!({}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }

    pub async fn press_button(&self, button: HardwareButton) -> Result<(), AgentError> {
        let resp = self
            .client
            .gesture
            .post(self.url("/wda/pressButton"))
            .json(&json!({"name": button.wire_name()}))
            .send()
            .await?;
        check_status(&resp)?;
        Ok(())
    }
}

fn check_status(resp: &reqwest::Response) -> Result<(), AgentError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    Err(AgentError::Status {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_id_accepts_both_wire_formats() {
        let legacy = json!({"ELEMENT": "abc-123"});
        let w3c = json!({"element-6066-11e4-a52e-4f735466cecf": "def-456"});
        assert_eq!(element_id(&legacy).unwrap(), "abc-123");
        assert_eq!(element_id(&w3c).unwrap(), "def-456");
        assert!(element_id(&json!({})).is_none());
    }

    #[test]
    fn base_url_shape() {
        let client = AgentClient::new("127.0.0.1", 8101);
        assert_eq!(client.base, "http://127.0.0.1:8101");
    }
}
