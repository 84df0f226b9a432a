use async_trait::async_trait;
use rand::Rng;
use resilient_fetch::{RawResponse, RequestError, Transport, TransportRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Payload served by the fake origin
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchNote {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub revision: u32,
}

impl BenchNote {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            title: format!("Note {}", id),
            body: format!("Body of note {} ", id).repeat(8),
            revision: (id % 1000) as u32,
        }
    }
}

/// Simulated HTTP origin with configurable latency
#[derive(Clone)]
pub struct FakeApi {
    notes: Arc<HashMap<String, serde_json::Value>>,
    latency_ms: u64,
    request_count: Arc<AtomicUsize>,
}

impl FakeApi {
    pub fn new(num_notes: usize, latency_ms: u64) -> Self {
        let mut notes = HashMap::new();
        for i in 0..num_notes {
            let note = BenchNote::new(i as u64);
            notes.insert(
                format!("/notes/{}", i),
                serde_json::to_value(&note).unwrap_or_default(),
            );
        }

        Self {
            notes: Arc::new(notes),
            latency_ms,
            request_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[allow(dead_code)]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn reset_count(&self) {
        self.request_count.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for FakeApi {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<RawResponse, RequestError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        // Simulate network latency
        tokio::select! {
            _ = cancel.cancelled() => return Err(RequestError::transport("aborted")),
            _ = tokio::time::sleep(Duration::from_millis(self.latency_ms)) => {}
        }

        Ok(match self.notes.get(&request.url) {
            Some(note) => RawResponse::json(200, note),
            None => RawResponse::new(404, "not found"),
        })
    }
}

/// Generate request paths for different workload patterns
pub struct PathGenerator {
    num_paths: usize,
}

impl PathGenerator {
    pub fn new(num_paths: usize) -> Self {
        Self { num_paths }
    }

    /// Generate sequential paths (for cold cache tests)
    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_paths).map(|i| format!("/notes/{}", i)).collect()
    }

    /// Generate paths for mixed workload (some hits, some misses)
    pub fn mixed(&self, hit_ratio: f64) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let hot_count = ((self.num_paths as f64 * hit_ratio) as usize).max(1);

        (0..1000)
            .map(|_| {
                if rng.gen_bool(hit_ratio) || hot_count >= self.num_paths {
                    format!("/notes/{}", rng.gen_range(0..hot_count))
                } else {
                    format!("/notes/{}", rng.gen_range(hot_count..self.num_paths))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_fake_api() {
        use super::FakeApi;
        use resilient_fetch::{RequestDescriptor, Transport, TransportRequest};
        use std::collections::BTreeMap;
        use tokio_util::sync::CancellationToken;

        let api = FakeApi::new(100, 1);
        let request = TransportRequest::from_descriptor(
            "",
            &BTreeMap::new(),
            &RequestDescriptor::get("/notes/0"),
        )
        .unwrap();

        let response = api.send(request, CancellationToken::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(api.request_count(), 1);
    }

    #[test]
    fn test_path_generator() {
        use super::PathGenerator;

        let paths = PathGenerator::new(100);

        let seq = paths.sequential();
        assert_eq!(seq.len(), 100);
        assert_eq!(seq[0], "/notes/0");

        let mixed = paths.mixed(0.8);
        assert_eq!(mixed.len(), 1000);
    }
}
