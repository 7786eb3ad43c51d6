use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::types::PipelineEvent;

const MAX_HISTORY_EVENTS: usize = 2_000;

struct ProjectStream {
    tx: broadcast::Sender<PipelineEvent>,
    history: VecDeque<PipelineEvent>,
}

/// Per-project indexing-event stream manager backing `GET /api/index/events`
/// (§6). Each pipeline run broadcasts its `PipelineEvent`s here in real
/// time; late subscribers get a bounded history replay plus the live tail.
pub struct IndexEventStreamManager {
    streams: Mutex<HashMap<i64, ProjectStream>>,
}

impl IndexEventStreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { streams: Mutex::new(HashMap::new()) })
    }

    fn project_id_of(event: &PipelineEvent) -> i64 {
        match event {
            PipelineEvent::Progress { project_id, .. }
            | PipelineEvent::FileCompleted { project_id, .. }
            | PipelineEvent::RunCompleted { project_id, .. }
            | PipelineEvent::RunFailed { project_id, .. } => *project_id,
        }
    }

    pub async fn publish(&self, event: PipelineEvent) {
        let project_id = Self::project_id_of(&event);
        let mut map = self.streams.lock().await;
        let stream = map.entry(project_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(512);
            ProjectStream { tx, history: VecDeque::new() }
        });
        let _ = stream.tx.send(event.clone());
        stream.history.push_back(event);
        if stream.history.len() > MAX_HISTORY_EVENTS {
            stream.history.pop_front();
        }
    }

    /// Subscribe to a project's indexing events.
    /// Returns (history_snapshot, live_receiver); the stream is created on
    /// first subscription if no run has published to it yet.
    pub async fn subscribe(&self, project_id: i64) -> (Vec<PipelineEvent>, broadcast::Receiver<PipelineEvent>) {
        let mut map = self.streams.lock().await;
        let stream = map.entry(project_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(512);
            ProjectStream { tx, history: VecDeque::new() }
        });
        let history: Vec<PipelineEvent> = stream.history.iter().cloned().collect();
        (history, stream.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipelineStep;

    #[tokio::test]
    async fn subscribers_receive_history_then_live_events() {
        let mgr = IndexEventStreamManager::new();
        mgr.publish(PipelineEvent::Progress { project_id: 1, step: PipelineStep::Discovery, message: "a".into() }).await;

        let (history, mut rx) = mgr.subscribe(1).await;
        assert_eq!(history.len(), 1);

        mgr.publish(PipelineEvent::RunCompleted { project_id: 1, files_indexed: 2 }).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PipelineEvent::RunCompleted { files_indexed: 2, .. }));
    }

    #[tokio::test]
    async fn streams_for_different_projects_are_independent() {
        let mgr = IndexEventStreamManager::new();
        mgr.publish(PipelineEvent::RunCompleted { project_id: 1, files_indexed: 1 }).await;
        mgr.publish(PipelineEvent::RunCompleted { project_id: 2, files_indexed: 9 }).await;

        let (history_one, _) = mgr.subscribe(1).await;
        let (history_two, _) = mgr.subscribe(2).await;
        assert_eq!(history_one.len(), 1);
        assert_eq!(history_two.len(), 1);
    }
}
