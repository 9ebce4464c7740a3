//! HTTP client for polling `nsqlookupd` to discover producers for a topic.

use serde::Deserialize;

use crate::error::{Error, Result};

/// One `nsqd` instance returned by a lookup poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Producer {
    /// Hostname or IP `nsqlookupd` advertises for this producer.
    pub broadcast_address: String,
    /// TCP port of the producer's `nsqd`.
    pub tcp_port: u16,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    producers: Vec<ProducerJson>,
}

#[derive(Debug, Deserialize)]
struct ProducerJson {
    broadcast_address: String,
    tcp_port: u16,
}

/// Polls one or more `nsqlookupd` bases for a topic's producer set.
#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    bases: Vec<String>,
}

impl LookupClient {
    /// Build a client over the given `http://host:port` base URLs. A
    /// trailing slash, if present, is trimmed.
    pub fn new(bases: Vec<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bases: bases
                .into_iter()
                .map(|b| b.trim_end_matches('/').to_string())
                .collect(),
        }
    }

    /// Poll every configured lookup host for `topic`'s producers, merging
    /// results across hosts. A single host's failure (network error, 404,
    /// truncated JSON) is logged and skipped — it never aborts the poll
    /// for the remaining hosts.
    pub async fn poll(&self, topic: &str) -> Vec<Producer> {
        self.poll_with_errors(topic).await.0
    }

    /// Like [`poll`](Self::poll), but also returns the `(host, message)`
    /// pairs for every lookup base that failed this cycle, so a caller can
    /// surface `ELOOKUPERROR` per host instead of only logging it.
    pub async fn poll_with_errors(&self, topic: &str) -> (Vec<Producer>, Vec<(String, String)>) {
        let mut producers = std::collections::HashSet::new();
        let mut errors = Vec::new();
        for base in &self.bases {
            match self.poll_one(base, topic).await {
                Ok(found) => producers.extend(found),
                Err(e) => {
                    log::warn!("lookup poll failed for {base}: {e}");
                    errors.push((base.clone(), e.to_string()));
                }
            }
        }
        (producers.into_iter().collect(), errors)
    }

    async fn poll_one(&self, base: &str, topic: &str) -> Result<Vec<Producer>> {
        let url = format!("{base}/lookup?topic={topic}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Lookup {
                host: url.clone(),
                source: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::Lookup {
                host: url,
                source: format!("HTTP {}", response.status()),
            });
        }

        let body: LookupResponse = response.json().await.map_err(|e| Error::Lookup {
            host: url,
            source: format!("invalid JSON: {e}"),
        })?;

        Ok(body
            .producers
            .into_iter()
            .map(|p| Producer {
                broadcast_address: p.broadcast_address,
                tcp_port: p.tcp_port,
            })
            .collect())
    }
}
