//! Session-scoped state shared by every process of one orchestration run.

use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::decoder::{DedupeState, SideEffectSink, StreamEventDecoder};
use crate::backend::events::SideEffect;

const SIDE_EFFECT_CAPACITY: usize = 1024;

/// One orchestration run: owns the manifest [`DedupeState`] and the side-effect broadcast.
///
/// Decoders created from the same session share the dedupe set, so a manifest
/// entry is reported once no matter which task's process rewrote the manifest.
#[derive(Debug, Clone)]
pub struct OrchestrationSession {
    id: Uuid,
    dedupe: Arc<Mutex<DedupeState>>,
    side_effects: broadcast::Sender<SideEffect>,
    manifest_pattern: Regex,
}

impl OrchestrationSession {
    pub fn new(manifest_pattern: Regex) -> Self {
        let (side_effects, _) = broadcast::channel(SIDE_EFFECT_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            dedupe: Arc::new(Mutex::new(DedupeState::new())),
            side_effects,
            manifest_pattern,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Observe side effects from every process started after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SideEffect> {
        self.side_effects.subscribe()
    }

    /// Fresh decoder wired to this session's side channel.
    pub fn decoder(&self) -> StreamEventDecoder {
        StreamEventDecoder::new(Some(SideEffectSink::new(
            self.side_effects.clone(),
            Arc::clone(&self.dedupe),
            self.manifest_pattern.clone(),
        )))
    }

    /// Number of distinct manifest entries reported so far.
    pub fn reported_entries(&self) -> usize {
        self.dedupe.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forget reported entries, starting a new dedupe scope.
    pub fn reset(&self) {
        self.dedupe.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::decoder::StreamKind;
    use crate::config::default_manifest_pattern;
    use serde_json::json;

    fn manifest_write(content: &str) -> Vec<u8> {
        let mut line = json!({
            "type": "assistant",
            "message": {"content": [{
                "type": "tool_use", "id": "t1", "name": "Write",
                "input": {"file_path": "subtasks.json", "content": content}
            }]}
        })
        .to_string();
        line.push('\n');
        line.into_bytes()
    }

    #[test]
    fn decoders_of_one_session_share_dedupe() {
        let session = OrchestrationSession::new(default_manifest_pattern());
        let mut rx = session.subscribe();
        let content = json!([{"id": "a", "title": "A"}]).to_string();

        session.decoder().push(StreamKind::Stdout, &manifest_write(&content));
        session.decoder().push(StreamKind::Stdout, &manifest_write(&content));

        let mut manifest_entries = 0;
        while let Ok(effect) = rx.try_recv() {
            if matches!(effect, SideEffect::ManifestEntry { .. }) {
                manifest_entries += 1;
            }
        }
        assert_eq!(manifest_entries, 1);
        assert_eq!(session.reported_entries(), 1);

        session.reset();
        assert_eq!(session.reported_entries(), 0);
    }

    #[test]
    fn separate_sessions_do_not_share_dedupe() {
        let first = OrchestrationSession::new(default_manifest_pattern());
        let second = OrchestrationSession::new(default_manifest_pattern());
        let content = json!(["same entry"]).to_string();

        first.decoder().push(StreamKind::Stdout, &manifest_write(&content));
        second.decoder().push(StreamKind::Stdout, &manifest_write(&content));

        assert_eq!(first.reported_entries(), 1);
        assert_eq!(second.reported_entries(), 1);
        assert_ne!(first.id(), second.id());
    }
}
