//! Per-project evaluator cache with a short TTL, so the matcher does not hit
//! the evaluator service on every batch.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use uuid::Uuid;

use crate::model::Evaluator;

/// Caches `Vec<Evaluator>` per `project_id`. Entries expire on a fixed TTL
/// rather than being pushed on evaluator edits: a stale read only delays
/// picking up a config change by at most `ttl`, which the spec accepts.
#[derive(Clone)]
pub struct EvaluatorCache {
    inner: Cache<Uuid, Arc<Vec<Evaluator>>>,
}

impl EvaluatorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder().time_to_live(ttl).build(),
        }
    }

    pub fn get(&self, project_id: Uuid) -> Option<Arc<Vec<Evaluator>>> {
        self.inner.get(&project_id)
    }

    pub fn set(&self, project_id: Uuid, evaluators: Vec<Evaluator>) {
        self.inner.insert(project_id, Arc::new(evaluators));
    }

    pub fn invalidate(&self, project_id: Uuid) {
        self.inner.invalidate(&project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScorerType;
    use serde_json::json;

    fn evaluator(project_id: Uuid) -> Evaluator {
        Evaluator {
            id: Uuid::now_v7(),
            project_id,
            active: true,
            span_names: vec![],
            filter: vec![],
            sampling_rate: 1.0,
            scorer_type: ScorerType::Builtin,
            scorer_config: json!({}),
            variable_mapping: vec![],
        }
    }

    #[test]
    fn get_and_set_round_trip() {
        let cache = EvaluatorCache::new(Duration::from_secs(30));
        let project_id = Uuid::now_v7();
        assert!(cache.get(project_id).is_none());

        cache.set(project_id, vec![evaluator(project_id)]);
        let cached = cache.get(project_id).expect("just inserted");
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn invalidate_clears_entry() {
        let cache = EvaluatorCache::new(Duration::from_secs(30));
        let project_id = Uuid::now_v7();
        cache.set(project_id, vec![evaluator(project_id)]);
        cache.invalidate(project_id);
        assert!(cache.get(project_id).is_none());
    }

    #[test]
    fn expires_after_ttl() {
        let cache = EvaluatorCache::new(Duration::from_millis(20));
        let project_id = Uuid::now_v7();
        cache.set(project_id, vec![evaluator(project_id)]);
        std::thread::sleep(Duration::from_millis(80));
        cache.inner.run_pending_tasks();
        assert!(cache.get(project_id).is_none());
    }
}
