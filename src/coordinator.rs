//! Retrying send loop for topic-scoped requests.
//!
//! The glue between the router and a connection: resolve a route, send,
//! classify what came back, refresh metadata when the classification
//! says the topology moved, and re-attempt under an injected retry
//! policy.

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, KafkaCode, Result},
    network::BrokerChannel,
    protocol::{KafkaRequest, KafkaResponse},
    retry::RetryPolicy,
    router::Router,
};

/// Sends one request to the leader of a `(topic, partition)` pair,
/// retrying across leader changes.
#[derive(Clone)]
pub struct SendCoordinator<T: BrokerChannel> {
    router: Router<T>,
    retry: RetryPolicy,
}

impl<T: BrokerChannel> SendCoordinator<T> {
    pub fn new(router: Router<T>, retry: RetryPolicy) -> Self {
        Self { router, retry }
    }

    pub fn router(&self) -> &Router<T> {
        &self.router
    }

    /// Send `request` to the partition leader and decode the response.
    ///
    /// Stale-metadata error codes and connection-class failures mark
    /// the cached topology invalid and re-attempt after a refresh;
    /// plain retryable codes re-attempt as-is; anything else surfaces
    /// with the endpoint that produced it.
    pub async fn send_to_partition<R, P>(
        &self,
        request: &R,
        topic: &str,
        partition_id: i32,
        cancel: &CancellationToken,
    ) -> Result<P>
    where
        R: KafkaRequest,
        P: TryFrom<Bytes, Error = Error> + KafkaResponse,
    {
        // unknown counts as invalid: the first attempt always verifies
        // the cache against its expiration window
        let mut metadata_invalid = true;
        let mut attempt = 0;
        loop {
            let err = match self
                .attempt(request, topic, partition_id, &mut metadata_invalid, cancel)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !recoverable(&err) {
                return Err(err);
            }
            match self.retry.backoff(attempt) {
                Some(delay) => {
                    tracing::debug!(
                        "Attempt {} for topic {} partition {} failed, retrying in {:?}: {:?}",
                        attempt,
                        topic,
                        partition_id,
                        delay,
                        err
                    );
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
                None => return Err(err),
            }
        }
    }

    async fn attempt<R, P>(
        &self,
        request: &R,
        topic: &str,
        partition_id: i32,
        metadata_invalid: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<P>
    where
        R: KafkaRequest,
        P: TryFrom<Bytes, Error = Error> + KafkaResponse,
    {
        if *metadata_invalid {
            self.router
                .refresh_topics(&[topic.to_string()], cancel)
                .await?;
            *metadata_invalid = false;
        }

        let route = match self.router.route_to_partition(topic, partition_id) {
            Ok(route) => route,
            Err(err) => {
                *metadata_invalid = true;
                return Err(err);
            }
        };

        let bytes = match route.connection.send(request, None, cancel).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return Err(Error::ArgError(
                    "request expects no response; send it on a channel directly".to_string(),
                ))
            }
            Err(err) => {
                if err.is_refresh_recoverable() {
                    *metadata_invalid = true;
                }
                return Err(err);
            }
        };

        let response = P::try_from(bytes)?;
        let codes: Vec<KafkaCode> = response
            .error_codes()
            .into_iter()
            .filter(|code| *code != KafkaCode::None)
            .collect();

        if codes.is_empty() {
            return Ok(response);
        }
        if codes.contains(&KafkaCode::OffsetOutOfRange) {
            *metadata_invalid = true;
            return Err(Error::FetchOutOfRange {
                topic: topic.to_string(),
                partition: partition_id,
            });
        }
        if codes.iter().all(|code| code.is_stale_metadata()) {
            tracing::debug!(
                "Stale metadata for topic {} partition {}: {:?}",
                topic,
                partition_id,
                codes
            );
            *metadata_invalid = true;
            return Err(Error::KafkaError(codes[0]));
        }
        if let Some(code) = codes.iter().find(|code| code.is_retryable()) {
            return Err(Error::KafkaError(*code));
        }
        Err(Error::Request {
            code: codes[0],
            endpoint: route.connection.endpoint().to_string(),
        })
    }
}

fn recoverable(err: &Error) -> bool {
    match err {
        Error::KafkaError(code) => code.is_retryable(),
        Error::Cancelled => false,
        err => err.is_refresh_recoverable(),
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
