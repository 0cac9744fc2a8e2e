//! Session-scoped shared state. Injected collaborators, never globals;
//! lifecycle is tied to one orchestrator session.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextData {
    pub goal: String,
    pub recent_paths: Vec<String>,
    pub variables: HashMap<String, Value>,
    /// Last known process id of the automated application.
    pub current_pid: Option<i64>,
}

/// Process-wide state with a single writer at a time; readers get snapshots.
/// Variable keys are namespaced per segment so segments stay disjoint unless
/// a value is explicitly propagated.
#[derive(Clone, Default)]
pub struct SharedContext {
    inner: Arc<RwLock<ContextData>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ContextData {
        self.inner.read().await.clone()
    }

    pub async fn set_goal(&self, goal: &str) {
        self.inner.write().await.goal = goal.to_string();
    }

    pub async fn set_pid(&self, pid: Option<i64>) {
        self.inner.write().await.current_pid = pid;
    }

    pub async fn current_pid(&self) -> Option<i64> {
        self.inner.read().await.current_pid
    }

    pub async fn push_recent_path(&self, path: &str) {
        let mut data = self.inner.write().await;
        data.recent_paths.retain(|p| p != path);
        data.recent_paths.push(path.to_string());
        if data.recent_paths.len() > 20 {
            data.recent_paths.remove(0);
        }
    }

    pub async fn set_variable(&self, segment: &str, key: &str, value: Value) {
        self.inner
            .write()
            .await
            .variables
            .insert(format!("{segment}:{key}"), value);
    }

    pub async fn variable(&self, segment: &str, key: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .variables
            .get(&format!("{segment}:{key}"))
            .cloned()
    }

    /// Copy one value across a segment boundary. The only sanctioned way for
    /// segments to share state.
    pub async fn propagate(&self, from_segment: &str, to_segment: &str, key: &str) {
        let value = self.variable(from_segment, key).await;
        if let Some(value) = value {
            self.set_variable(to_segment, key, value).await;
        }
    }

    /// Drop everything scoped to a finished segment.
    pub async fn clear_segment(&self, segment: &str) {
        let prefix = format!("{segment}:");
        self.inner
            .write()
            .await
            .variables
            .retain(|k, _| !k.starts_with(&prefix));
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lng: f64,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapData {
    pub markers: Vec<RoutePoint>,
    pub last_distance_text: Option<String>,
    pub last_duration_text: Option<String>,
    pub last_route_summary: Option<String>,
}

/// Visual map state fed by the dispatcher's maps post-processing hook.
/// Frontends read it; the core only writes.
#[derive(Clone, Default)]
pub struct MapState {
    inner: Arc<RwLock<MapData>>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MapData {
        self.inner.read().await.clone()
    }

    pub async fn record_distance(&self, distance: &str, duration: &str) {
        let mut data = self.inner.write().await;
        data.last_distance_text = Some(distance.to_string());
        data.last_duration_text = Some(duration.to_string());
    }

    pub async fn record_route(&self, summary: &str) {
        self.inner.write().await.last_route_summary = Some(summary.to_string());
    }

    pub async fn add_marker(&self, point: RoutePoint) {
        self.inner.write().await.markers.push(point);
    }
}
