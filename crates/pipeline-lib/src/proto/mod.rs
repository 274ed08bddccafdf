//! Compact binary ingest envelope
//!
//! Hand-maintained prost messages mirroring the JSON `{samples: [...]}`
//! envelope, accepted on the ingest endpoint as `application/x-protobuf`.

use crate::models::{Labels, MetricSample, SampleBatch};
use thiserror::Error;

pub mod telemetry {
    pub mod v1 {
        use prost::Message;
        use std::collections::BTreeMap;

        #[derive(Clone, PartialEq, Message)]
        pub struct MetricSample {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(message, optional, tag = "2")]
            pub timestamp: Option<prost_types::Timestamp>,
            #[prost(double, tag = "3")]
            pub value: f64,
            #[prost(btree_map = "string, string", tag = "4")]
            pub labels: BTreeMap<String, String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct SampleBatch {
            #[prost(message, repeated, tag = "1")]
            pub samples: Vec<MetricSample>,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode protobuf batch: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("sample {index} has no timestamp")]
    MissingTimestamp { index: usize },
}

/// Decode a protobuf `SampleBatch` into the pipeline's sample model
pub fn decode_batch(bytes: &[u8]) -> Result<SampleBatch, CodecError> {
    use prost::Message;

    let batch = telemetry::v1::SampleBatch::decode(bytes)?;
    let samples = batch
        .samples
        .into_iter()
        .enumerate()
        .map(|(index, sample)| {
            let ts = sample
                .timestamp
                .ok_or(CodecError::MissingTimestamp { index })?;
            Ok(MetricSample {
                timestamp_ms: ts.seconds * 1000 + i64::from(ts.nanos) / 1_000_000,
                name: sample.name,
                value: sample.value,
                labels: sample.labels.into_iter().collect::<Labels>(),
            })
        })
        .collect::<Result<Vec<_>, CodecError>>()?;

    Ok(SampleBatch { samples })
}

/// Encode a batch for the binary envelope (used by the CLI and tests)
pub fn encode_batch(batch: &SampleBatch) -> Vec<u8> {
    use prost::Message;

    let proto = telemetry::v1::SampleBatch {
        samples: batch
            .samples
            .iter()
            .map(|s| telemetry::v1::MetricSample {
                name: s.name.clone(),
                timestamp: Some(prost_types::Timestamp {
                    seconds: s.timestamp_ms.div_euclid(1000),
                    nanos: (s.timestamp_ms.rem_euclid(1000) * 1_000_000) as i32,
                }),
                value: s.value,
                labels: s.labels.clone(),
            })
            .collect(),
    };
    proto.encode_to_vec()
}
