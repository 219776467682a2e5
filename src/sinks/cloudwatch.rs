use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::aws::AwsJsonClient;
use super::sigv4::Credentials;
use super::{AppendOutcome, LogEvent, LogGroupApi, LogStreamInfo, RejectedEvents, SinkError};

const SERVICE: &str = "logs";
const TARGET_PREFIX: &str = "Logs_20140328";

/// Grouped log-stream service over the CloudWatch Logs JSON API.
#[derive(Debug, Clone)]
pub struct CloudWatchLogs {
    client: AwsJsonClient,
}

impl CloudWatchLogs {
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
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name_prefix: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsResponse {
    #[serde(default)]
    log_streams: Vec<LogStreamEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStreamEntry {
    #[serde(default)]
    log_stream_name: String,
    upload_sequence_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStreamRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: Vec<InputLogEvent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct InputLogEvent<'a> {
    message: &'a str,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsResponse {
    next_sequence_token: Option<String>,
    rejected_log_events_info: Option<RejectedLogEventsInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectedLogEventsInfo {
    too_new_log_event_start_index: Option<i64>,
    too_old_log_event_end_index: Option<i64>,
    expired_log_event_end_index: Option<i64>,
}

impl From<RejectedLogEventsInfo> for RejectedEvents {
    fn from(info: RejectedLogEventsInfo) -> Self {
        Self {
            too_new_start_index: info.too_new_log_event_start_index,
            too_old_end_index: info.too_old_log_event_end_index,
            expired_end_index: info.expired_log_event_end_index,
        }
    }
}

fn append_request<'a>(
    group: &'a str,
    stream: &'a str,
    events: &'a [LogEvent],
    token: Option<&'a str>,
) -> PutLogEventsRequest<'a> {
    PutLogEventsRequest {
        log_group_name: group,
        log_stream_name: stream,
        log_events: events
            .iter()
            .map(|event| InputLogEvent {
                message: &event.message,
                timestamp: event.timestamp_ms,
            })
            .collect(),
        sequence_token: token,
    }
}

#[async_trait]
impl LogGroupApi for CloudWatchLogs {
    async fn describe_streams(
        &self,
        group: &str,
        prefix: &str,
    ) -> Result<Vec<LogStreamInfo>, SinkError> {
        let request = DescribeLogStreamsRequest {
            log_group_name: group,
            log_stream_name_prefix: prefix,
        };
        let response: DescribeLogStreamsResponse =
            self.client.call("DescribeLogStreams", &request).await?;
        Ok(response
            .log_streams
            .into_iter()
            .map(|entry| LogStreamInfo {
                name: entry.log_stream_name,
                upload_sequence_token: entry.upload_sequence_token,
            })
            .collect())
    }

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        let request = CreateLogStreamRequest {
            log_group_name: group,
            log_stream_name: stream,
        };
        match self.client.call::<_, Empty>("CreateLogStream", &request).await {
            Ok(_) => Ok(()),
            Err(SinkError::Api { code, .. }) if code == "ResourceAlreadyExistsException" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn append_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
        token: Option<&str>,
    ) -> Result<AppendOutcome, SinkError> {
        let request = append_request(group, stream, events, token);
        let response: PutLogEventsResponse = self.client.call("PutLogEvents", &request).await?;
        Ok(AppendOutcome {
            next_token: response.next_sequence_token,
            rejected: response.rejected_log_events_info.map(RejectedEvents::from),
        })
    }
}
