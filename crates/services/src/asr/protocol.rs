//! Upstream realtime-ASR event protocol (spec §6 "Upstream ASR protocol").
//!
//! Outbound: a `run-task` JSON text frame followed by binary PCM frames.
//! Inbound: JSON text frames tagged by `event`. Reuses the
//! tagged-variant-decoded-once-at-the-boundary shape `realtime::ports`'
//! `ClientEvent`/`ServerEvent` use for the client-facing WebSocket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct RunTask {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub task_id: String,
    pub model: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: &'static str,
}

impl RunTask {
    pub fn new(task_id: String, model: String, sample_rate: u32) -> Self {
        Self {
            event_type: "run-task",
            task_id,
            model,
            sample_rate,
            channels: 1,
            format: "pcm_s16le",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum UpstreamEvent {
    TaskStarted,
    ResultGenerated(ResultGenerated),
    TaskFinished,
    TaskFailed { code: String, message: String },
}

/// The provider's "is this result final" signal has drifted across
/// versions (`is_final`, `final`, `sentence_end`, `end_of_sentence` have
/// all been observed); [`ResultGenerated::is_final_marker`] treats
/// whichever one is present as authoritative, per spec §4.4.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultGenerated {
    pub text: String,
    #[serde(default)]
    pub offset_ms: i64,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub is_final: Option<bool>,
    #[serde(default, rename = "final")]
    pub r#final: Option<bool>,
    #[serde(default)]
    pub sentence_end: Option<bool>,
    #[serde(default)]
    pub end_of_sentence: Option<bool>,
}

impl ResultGenerated {
    pub fn is_final_marker(&self) -> bool {
        [self.is_final, self.r#final, self.sentence_end, self.end_of_sentence]
            .into_iter()
            .flatten()
            .next()
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_generated_defaults_to_final_when_no_marker_present() {
        let r = ResultGenerated {
            text: "hi".to_string(),
            offset_ms: 0,
            duration_ms: 500,
            is_final: None,
            r#final: None,
            sentence_end: None,
            end_of_sentence: None,
        };
        assert!(r.is_final_marker());
    }

    #[test]
    fn result_generated_respects_explicit_false() {
        let mut r = ResultGenerated {
            text: "hi".to_string(),
            offset_ms: 0,
            duration_ms: 500,
            is_final: None,
            r#final: None,
            sentence_end: None,
            end_of_sentence: None,
        };
        r.sentence_end = Some(false);
        assert!(!r.is_final_marker());
    }

    #[test]
    fn task_failed_parses_from_json() {
        let raw = r#"{"event":"task-failed","code":"UPSTREAM_ERROR","message":"boom"}"#;
        let event: UpstreamEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, UpstreamEvent::TaskFailed { .. }));
    }
}
