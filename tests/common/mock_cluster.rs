//! Mock [`ClusterControl`] that records lifecycle calls.

use repdyno::cluster::{ClusterControl, ClusterFuture, ClusterSetting};
use repdyno::error::HarnessError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct MockCluster {
    url: String,
    alive: AtomicBool,
    started_with: Mutex<Vec<Vec<ClusterSetting>>>,
    killed: Mutex<Vec<u32>>,
    nodes: u32,
}

impl MockCluster {
    /// A cluster of `nodes` nodes reachable at `url` once started.
    pub fn new(url: &str, nodes: u32) -> Self {
        Self {
            url: url.to_string(),
            alive: AtomicBool::new(false),
            started_with: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            nodes,
        }
    }

    /// Settings passed to each `start` call.
    pub fn starts(&self) -> Vec<Vec<ClusterSetting>> {
        self.started_with.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

impl ClusterControl for MockCluster {
    fn start<'a>(&'a self, settings: &'a [ClusterSetting]) -> ClusterFuture<'a, String> {
        Box::pin(async move {
            self.started_with.lock().unwrap().push(settings.to_vec());
            self.alive.store(true, Ordering::SeqCst);
            Ok(self.url.clone())
        })
    }

    fn stop(&self) -> ClusterFuture<'_, ()> {
        Box::pin(async move {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn kill_node(&self, node: u32) -> ClusterFuture<'_, ()> {
        Box::pin(async move {
            if node == 0 || node > self.nodes {
                return Err(HarnessError::Cluster(format!("no such node: {}", node)));
            }
            self.killed.lock().unwrap().push(node);
            Ok(())
        })
    }

    fn is_alive(&self) -> ClusterFuture<'_, bool> {
        Box::pin(async move { Ok(self.alive.load(Ordering::SeqCst)) })
    }
}
