//! Outbound HTTP call observation

use crate::capture::Pipeline;
use crate::failure::Failure;
use crate::record::{CaptureContext, RequestInfo};
use async_trait::async_trait;
use reqwest::{Client, Request, Response};
use std::error::Error as StdError;
use std::sync::Arc;

/// Status text for codes without a registered reason phrase
const UNKNOWN_STATUS: &str = "Unknown Status";

/// An outbound HTTP call implementation
#[async_trait]
pub trait Fetch: Send + Sync {
    type Error: StdError + Send + 'static;

    async fn fetch(&self, request: Request) -> Result<Response, Self::Error>;
}

#[async_trait]
impl Fetch for Client {
    type Error = reqwest::Error;

    async fn fetch(&self, request: Request) -> Result<Response, Self::Error> {
        self.execute(request).await
    }
}

/// Decorator recording failed calls and error responses made through `inner`.
///
/// Outcomes are passed back untouched: the same response, the same error.
pub struct ObservedFetch<F> {
    inner: F,
    pipeline: Option<Arc<Pipeline>>,
    min_error_status: u16,
}

impl<F: Fetch> ObservedFetch<F> {
    /// Without a pipeline the decorator only forwards calls
    pub fn new(inner: F, pipeline: Option<Arc<Pipeline>>, min_error_status: u16) -> Self {
        Self {
            inner,
            pipeline,
            min_error_status,
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

#[async_trait]
impl<F: Fetch> Fetch for ObservedFetch<F> {
    type Error = F::Error;

    async fn fetch(&self, request: Request) -> Result<Response, Self::Error> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return self.inner.fetch(request).await;
        };

        let url = request.url().to_string();
        let method = request.method().to_string();

        match self.inner.fetch(request).await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() >= self.min_error_status {
                    let status_text = status.canonical_reason().unwrap_or(UNKNOWN_STATUS);
                    let failure = Failure::known(
                        "HTTPError",
                        format!("HTTP {}: {}", status.as_u16(), status_text),
                    );
                    let info = RequestInfo::new(url, method).with_status(status.as_u16(), status_text);
                    pipeline.dispatch(&failure, CaptureContext::FETCH_RESPONSE, Some(&info));
                }
                Ok(response)
            }
            Err(err) => {
                let info = RequestInfo::new(url, method);
                pipeline.dispatch(
                    &Failure::from_error(&err),
                    CaptureContext::FETCH_ERROR,
                    Some(&info),
                );
                Err(err)
            }
        }
    }
}
