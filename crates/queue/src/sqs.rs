//! AWS SQS message source and reply sink.
//!
//! A peek-lock on SQS is a `ReceiveMessage` with a visibility timeout: the
//! message stays in the queue, invisible to other consumers, until it is
//! deleted (complete) or its visibility is reset to zero (abandon). The
//! receipt handle needed for either call is kept per locked message.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{Message, MessageAttributeValue};
use aws_sdk_sqs::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use batchpoint_core::config::AwsConfig;

use crate::error::QueueError;
use crate::message::{InboundMessage, MessageId, MessageProperties, OutboundMessage};
use crate::sink::ReplySink;
use crate::source::{HandlingErrorKind, MessageSource};

/// Message attribute carrying the grouping class.
pub const ATTR_CLASS_ID: &str = "ClassId";
/// Message attribute carrying the type tag.
pub const ATTR_TYPE: &str = "Type";
/// Message attribute carrying the source object type.
pub const ATTR_OBJECT_TYPE: &str = "ObjectType";
/// Outbound attribute naming the class folded into a batch.
pub const ATTR_BATCH_CLASS: &str = "BatchClass";

/// SQS long polling is capped at 20 seconds per request.
const MAX_WAIT_SECS: u64 = 20;

/// Build an SQS client from project config.
fn build_client(aws: &AwsConfig) -> Client {
    let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

    // Build the client config directly; aws_config::defaults() would pick up
    // AWS_ENDPOINT_URL meant for other services.
    let mut sqs_config = aws_sdk_sqs::Config::builder()
        .region(region)
        .behavior_version(BehaviorVersion::latest());

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        let creds = Credentials::new(
            key_id,
            secret,
            aws.session_token.clone(),
            None,
            "batchpoint-static",
        );
        sqs_config = sqs_config.credentials_provider(creds);
    }

    if let Some(ref endpoint) = aws.endpoint_url {
        if !endpoint.is_empty() {
            let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{endpoint}")
            };
            sqs_config = sqs_config.endpoint_url(&url);
        }
    }

    Client::from_conf(sqs_config.build())
}

/// Error codes meaning the queue is gone.
const NOT_FOUND_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

/// Error codes meaning the credentials are missing, wrong or not allowed.
const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "ExpiredToken",
    "InvalidClientTokenId",
    "InvalidSecurity",
    "MissingAuthenticationToken",
    "SignatureDoesNotMatch",
    "UnrecognizedClientException",
];

/// Map an SQS error code onto a queue error; unknown codes use `other`.
fn classify_code(code: Option<&str>, detail: String, other: fn(String) -> QueueError) -> QueueError {
    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => QueueError::NotFound(detail),
        Some(c) if AUTH_CODES.contains(&c) => QueueError::Auth(detail),
        _ => other(detail),
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>, context: &str, other: fn(String) -> QueueError) -> QueueError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_string);
    classify_code(code.as_deref(), format!("{context}: {err:?}"), other)
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, QueueError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| QueueError::Provider(format!("invalid message attribute: {e}")))
}

fn read_attribute(msg: &Message, name: &str) -> Option<String> {
    msg.message_attributes()
        .and_then(|attrs| attrs.get(name))
        .and_then(|v| v.string_value())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// What we need to resolve a lock later.
struct LockedMessage {
    receipt_handle: String,
    body: String,
    class_id: String,
    message_type: String,
}

/// SQS-backed peek-lock message source.
pub struct SqsMessageSource {
    client: Client,
    queue_url: String,
    dlq_url: Option<String>,
    visibility_timeout_secs: i32,
    locks: Mutex<HashMap<MessageId, LockedMessage>>,
}

impl SqsMessageSource {
    pub fn new(
        aws: &AwsConfig,
        queue_url: impl Into<String>,
        dlq_url: Option<String>,
        visibility_timeout_secs: u64,
    ) -> Self {
        let queue_url = queue_url.into();
        info!(
            queue_url = %queue_url,
            region = %aws.region,
            dlq = dlq_url.as_deref().unwrap_or("(none)"),
            "SQS message source initialized"
        );
        Self {
            client: build_client(aws),
            queue_url,
            dlq_url,
            visibility_timeout_secs: visibility_timeout_secs.min(i32::MAX as u64) as i32,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn take_lock(&self, id: MessageId) -> Result<LockedMessage, QueueError> {
        self.locks
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| QueueError::Ack(format!("no lock held for message {id}")))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| sdk_error(e, "SQS delete failed", QueueError::Ack))?;
        Ok(())
    }

    /// Copy a message to the dead-letter queue with the failure reason attached.
    async fn forward_to_dlq(
        &self,
        dlq_url: &str,
        locked: &LockedMessage,
        kind: HandlingErrorKind,
        detail: &str,
    ) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(dlq_url)
            .message_body(&locked.body)
            .message_attributes(ATTR_CLASS_ID, string_attribute(&locked.class_id)?)
            .message_attributes(ATTR_TYPE, string_attribute(&locked.message_type)?)
            .message_attributes("ErrorKind", string_attribute(&kind.to_string())?)
            .message_attributes("ErrorDetail", string_attribute(detail)?)
            .send()
            .await
            .map_err(|e| sdk_error(e, "SQS DLQ send failed", QueueError::Provider))?;
        Ok(())
    }
}

#[async_trait]
impl MessageSource for SqsMessageSource {
    async fn peek_lock(&self, timeout: Duration) -> Result<Option<InboundMessage>, QueueError> {
        let wait_secs = timeout.as_secs().min(MAX_WAIT_SECS) as i32;

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| match e {
                SdkError::TimeoutError(_) => QueueError::Timeout(timeout.as_millis() as u64),
                e => sdk_error(e, "SQS receive failed", QueueError::Connection),
            })?;

        let Some(msg) = resp.messages.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };

        let receipt_handle = msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
            .to_string();

        // SQS message ids are UUIDs; anything else still needs a unique key.
        let id = msg
            .message_id()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        let body = msg.body().unwrap_or("").to_string();
        let message_type = read_attribute(&msg, ATTR_TYPE).unwrap_or_default();
        let object_type = read_attribute(&msg, ATTR_OBJECT_TYPE);

        let locked = LockedMessage {
            receipt_handle,
            body: body.clone(),
            class_id: read_attribute(&msg, ATTR_CLASS_ID).unwrap_or_default(),
            message_type: message_type.clone(),
        };

        if locked.class_id.is_empty() {
            // Without a class the message can never be batched; dead-letter it
            // here instead of letting it cycle through redeliveries.
            warn!(message_id = %id, "SQS message without ClassId attribute");
            let detail = format!("message {id} has no {ATTR_CLASS_ID} attribute");
            if let Some(dlq_url) = &self.dlq_url {
                self.forward_to_dlq(dlq_url, &locked, HandlingErrorKind::InvalidBody, &detail)
                    .await?;
            }
            self.delete(&locked.receipt_handle).await?;
            return Ok(None);
        }

        debug!(message_id = %id, class_id = %locked.class_id, "Locked SQS message");

        let message = InboundMessage {
            id,
            class_id: locked.class_id.clone(),
            message_type,
            body: body.into_bytes(),
            properties: MessageProperties { object_type },
        };
        self.locks.lock().await.insert(id, locked);
        Ok(Some(message))
    }

    async fn complete(&self, id: MessageId) -> Result<(), QueueError> {
        let receipt_handle = {
            let locks = self.locks.lock().await;
            locks
                .get(&id)
                .map(|l| l.receipt_handle.clone())
                .ok_or_else(|| QueueError::Ack(format!("no lock held for message {id}")))?
        };
        // The lock is only released once the delete went through, so a failed
        // completion can still be dead-lettered.
        self.delete(&receipt_handle).await?;
        self.locks.lock().await.remove(&id);
        debug!(message_id = %id, "Completed SQS message");
        Ok(())
    }

    async fn complete_with_error(
        &self,
        id: MessageId,
        kind: HandlingErrorKind,
        detail: &str,
    ) -> Result<(), QueueError> {
        let locked = self.take_lock(id).await?;
        match &self.dlq_url {
            Some(dlq_url) => self.forward_to_dlq(dlq_url, &locked, kind, detail).await?,
            None => warn!(
                message_id = %id,
                %kind,
                detail,
                "No DLQ configured, dropping failed message"
            ),
        }
        self.delete(&locked.receipt_handle).await
    }

    async fn abandon(&self, id: MessageId) -> Result<(), QueueError> {
        let locked = self.take_lock(id).await?;
        debug!(message_id = %id, "Abandoning SQS message (visibility=0)");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&locked.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| sdk_error(e, "SQS visibility change failed", QueueError::Provider))?;
        Ok(())
    }
}

/// Sink that publishes each batch to an outbound SQS queue.
pub struct SqsReplySink {
    client: Client,
    queue_url: String,
}

impl SqsReplySink {
    pub fn new(aws: &AwsConfig, queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        info!(queue_url = %queue_url, "SQS reply sink initialized");
        Self {
            client: build_client(aws),
            queue_url,
        }
    }
}

#[async_trait]
impl ReplySink for SqsReplySink {
    async fn handle_reply(&self, batch: &OutboundMessage) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&batch.body)
            .message_attributes(ATTR_CLASS_ID, string_attribute(&batch.class_id)?)
            .message_attributes(ATTR_TYPE, string_attribute(&batch.message_type)?)
            .message_attributes(ATTR_BATCH_CLASS, string_attribute(&batch.batch_class)?)
            .message_attributes("BatchId", string_attribute(&batch.id.to_string())?)
            .send()
            .await
            .map_err(|e| sdk_error(e, "SQS send failed", QueueError::Rejected))?;

        debug!(batch_id = %batch.id, batch_class = %batch.batch_class, "Batch sent to SQS");
        Ok(())
    }
}
