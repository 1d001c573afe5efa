//! CLI config for producer-side batching.

use std::collections::BTreeMap;
use std::num::ParseIntError;
use std::time::Duration;

use batchflow_collector::BatchSizes;
use batchflow_types::StreamId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid stream batch size '{0}' - expected 'STREAM=SIZE'")]
    MissingSeparator(String),

    #[error("empty stream name in '{0}'")]
    EmptyStream(String),

    #[error("invalid batch size in '{input}': {source}")]
    InvalidSize {
        input: String,
        source: ParseIntError,
    },

    #[error("batch size for stream '{0}' passed multiple times")]
    DuplicateStream(StreamId),

    #[error("invalid flush interval: {0}")]
    InvalidDuration(#[from] humantime::DurationError),

    #[error("the flush interval must be positive")]
    ZeroFlushInterval,
}

/// The batch capacity of one named stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatchSize {
    pub stream: StreamId,
    pub size: i64,
}

/// CLI config for producer-side batching.
#[derive(Debug, Clone, clap::Parser)]
pub struct BatchingConfig {
    /// The number of records collected per destination before a batch is
    /// sent. Zero or less disables batching.
    #[clap(
        long = "batch-size",
        env = "BATCHFLOW_BATCH_SIZE",
        default_value = "0",
        allow_negative_numbers = true,
        action
    )]
    pub batch_size: i64,

    /// Per-stream batch sizes overriding `--batch-size`, as a comma-separated
    /// list of STREAM=SIZE pairs.
    ///
    /// # Example
    /// ```text
    /// --stream-batch-size "clicks=500,alerts=0"
    /// ```
    #[clap(
        long = "stream-batch-size",
        env = "BATCHFLOW_STREAM_BATCH_SIZE",
        value_parser = parse_stream_batch_size,
        value_delimiter = ',',
        action = clap::ArgAction::Append
    )]
    pub stream_batch_sizes: Vec<StreamBatchSize>,

    /// Flush partially filled batches at this interval. Without it partial
    /// batches are only sent when the producer shuts down.
    #[clap(
        long = "flush-interval",
        env = "BATCHFLOW_FLUSH_INTERVAL",
        value_parser = parse_flush_interval,
        action
    )]
    pub flush_interval: Option<Duration>,
}

impl BatchingConfig {
    /// The batch sizes described by this config.
    pub fn batch_sizes(&self) -> Result<BatchSizes, ParseError> {
        if self.stream_batch_sizes.is_empty() {
            return Ok(BatchSizes::uniform(self.batch_size));
        }

        let mut overrides = BTreeMap::new();
        for StreamBatchSize { stream, size } in &self.stream_batch_sizes {
            if overrides.insert(stream.clone(), *size).is_some() {
                return Err(ParseError::DuplicateStream(stream.clone()));
            }
        }
        Ok(BatchSizes::PerStream {
            default: self.batch_size,
            overrides,
        })
    }
}

fn parse_stream_batch_size(s: &str) -> Result<StreamBatchSize, ParseError> {
    let (stream, size) = s
        .split_once('=')
        .ok_or_else(|| ParseError::MissingSeparator(s.to_owned()))?;

    let stream = stream.trim();
    if stream.is_empty() {
        return Err(ParseError::EmptyStream(s.to_owned()));
    }
    let size = size
        .trim()
        .parse()
        .map_err(|source| ParseError::InvalidSize {
            input: s.to_owned(),
            source,
        })?;

    Ok(StreamBatchSize {
        stream: StreamId::from(stream),
        size,
    })
}

fn parse_flush_interval(s: &str) -> Result<Duration, ParseError> {
    match humantime::parse_duration(s)? {
        d if d.is_zero() => Err(ParseError::ZeroFlushInterval),
        d => Ok(d),
    }
}
