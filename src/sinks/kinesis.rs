use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::aws::AwsJsonClient;
use super::sigv4::Credentials;
use super::{RecordResult, SinkError, StreamApi, StreamRecord};

const SERVICE: &str = "kinesis";
const TARGET_PREFIX: &str = "Kinesis_20131202";

/// Sharded stream service over the Kinesis JSON API.
#[derive(Debug, Clone)]
pub struct KinesisStreams {
    client: AwsJsonClient,
}

impl KinesisStreams {
    pub fn new(
        endpoint: &str,
        region: &str,
        timeout: Duration,
        credentials: Option<Credentials>,
    ) -> Result<Self, SinkError> {
        let client =
            AwsJsonClient::new(endpoint, region, SERVICE, TARGET_PREFIX, timeout, credentials)?;
        Ok(Self { client })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsRequest<'a> {
    stream_name: &'a str,
    records: Vec<PutRecordsEntry<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsEntry<'a> {
    data: String,
    partition_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsResponse {
    #[serde(default)]
    records: Vec<PutRecordsResultEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsResultEntry {
    error_code: Option<String>,
    error_message: Option<String>,
}

fn put_records_request<'a>(stream: &'a str, records: &'a [StreamRecord]) -> PutRecordsRequest<'a> {
    PutRecordsRequest {
        stream_name: stream,
        records: records
            .iter()
            .map(|record| PutRecordsEntry {
                data: STANDARD.encode(&record.data),
                partition_key: &record.partition_key,
            })
            .collect(),
    }
}

#[async_trait]
impl StreamApi for KinesisStreams {
    async fn put_batch(
        &self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<Vec<RecordResult>, SinkError> {
        let request = put_records_request(stream, records);
        let response: PutRecordsResponse = self.client.call("PutRecords", &request).await?;
        Ok(response
            .records
            .into_iter()
            .map(|entry| RecordResult {
                error_code: entry.error_code,
                error_message: entry.error_message,
            })
            .collect())
    }
}
