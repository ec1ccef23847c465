use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub chunk_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub collection: String,
    pub batch_id: Uuid,
    pub chunk_count: usize,
    pub first_ordinal: u64,
    pub finished_at: DateTime<Utc>,
}

/// Similarity metric shared by ingestion and query. Stored vectors are only
/// comparable under the metric they were indexed with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(feature = "clap", value(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    #[cfg_attr(feature = "clap", value(alias = "l2", alias = "euclidean"))]
    NegativeSquaredEuclidean,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::NegativeSquaredEuclidean => "negative_squared_euclidean",
        }
    }

    /// Higher is more similar for every metric.
    pub fn similarity(&self, left: &[f32], right: &[f32]) -> f64 {
        match self {
            Self::Cosine => {
                let mut dot = 0f64;
                let mut left_norm = 0f64;
                let mut right_norm = 0f64;
                for (a, b) in left.iter().zip(right.iter()) {
                    let (a, b) = (f64::from(*a), f64::from(*b));
                    dot += a * b;
                    left_norm += a * a;
                    right_norm += b * b;
                }
                if left_norm == 0.0 || right_norm == 0.0 {
                    return 0.0;
                }
                dot / (left_norm.sqrt() * right_norm.sqrt())
            }
            Self::NegativeSquaredEuclidean => -left
                .iter()
                .zip(right.iter())
                .map(|(a, b)| {
                    let delta = f64::from(*a) - f64::from(*b);
                    delta * delta
                })
                .sum::<f64>(),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "negative_squared_euclidean" | "l2" | "euclidean" => {
                Ok(Self::NegativeSquaredEuclidean)
            }
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}
