// Copyright the metered-billing authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::{StatusCode, Url};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::usage::{FilterGroup, FilteredUsage, UsageBucket, UsageQuantity, UsageQuery, UsageSource};

/// Configures the required parameters of a [`UsageHttpClient`].
pub struct UsageHttpClientConfig {
    /// The API key to authenticate with.
    pub api_key: String,
    /// The base endpoint of the aggregation service.
    pub endpoint: Url,
}

/// A builder for a [`UsageHttpClient`].
pub struct UsageHttpClientBuilder {
    max_retries: u32,
    min_retry_backoff: Duration,
    max_retry_backoff: Duration,
}

impl Default for UsageHttpClientBuilder {
    fn default() -> UsageHttpClientBuilder {
        UsageHttpClientBuilder {
            max_retries: 3,
            min_retry_backoff: Duration::from_millis(250),
            max_retry_backoff: Duration::from_secs(10),
        }
    }
}

impl UsageHttpClientBuilder {
    /// Sets the number of times transient failures (connection errors, 429s,
    /// 5xxs) are retried with exponential backoff before surfacing as an
    /// `integration_failure`.
    pub fn max_retries(mut self, max_retries: u32) -> UsageHttpClientBuilder {
        self.max_retries = max_retries;
        self
    }

    /// Sets the bounds of the backoff between retries.
    pub fn retry_backoff(mut self, min: Duration, max: Duration) -> UsageHttpClientBuilder {
        self.min_retry_backoff = min;
        self.max_retry_backoff = max;
        self
    }

    /// Creates a [`UsageHttpClient`] that incorporates the optional
    /// parameters configured on the builder and the specified required
    /// parameters.
    pub fn build(self, config: UsageHttpClientConfig) -> UsageHttpClient {
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(self.min_retry_backoff, self.max_retry_backoff)
            .build_with_max_retries(self.max_retries);
        let inner = reqwest_middleware::ClientBuilder::new(
            reqwest::ClientBuilder::new()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(Duration::from_secs(60))
                .build()
                .expect("client configuration known to be valid"),
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();
        UsageHttpClient {
            inner,
            api_key: config.api_key,
            usage_url: resource_url(&config.endpoint, "usage"),
            filtered_url: resource_url(&config.endpoint, "usage/filtered"),
            buckets_url: resource_url(&config.endpoint, "usage/buckets"),
        }
    }
}

/// Resolves a resource path under the service base URL. The aggregation API
/// has a fixed, small surface, so each resource URL is computed once when
/// the client is built.
fn resource_url(endpoint: &Url, resource: &str) -> Url {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .expect("aggregation endpoint must be a base URL")
        .extend(resource.split('/'));
    url
}

/// An HTTP client for the usage-aggregation service.
///
/// The client is designed to be wrapped in an [`Arc`] and used from multiple
/// threads simultaneously.
///
/// [`Arc`]: std::sync::Arc
#[derive(Debug)]
pub struct UsageHttpClient {
    inner: ClientWithMiddleware,
    api_key: String,
    usage_url: Url,
    filtered_url: Url,
    buckets_url: Url,
}

impl UsageHttpClient {
    /// Creates a new `UsageHttpClient` from its required configuration
    /// parameters.
    pub fn new(config: UsageHttpClientConfig) -> UsageHttpClient {
        UsageHttpClientBuilder::default().build(config)
    }

    /// Creates a builder for a `UsageHttpClient` that allows for
    /// customization of optional parameters.
    pub fn builder() -> UsageHttpClientBuilder {
        UsageHttpClientBuilder::default()
    }

    /// Every aggregation call is an authenticated POST against one of the
    /// precomputed resource URLs.
    fn post(&self, url: &Url) -> RequestBuilder {
        self.inner.post(url.clone()).bearer_auth(&self.api_key)
    }

    async fn send_request<T>(&self, req: RequestBuilder) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        #[derive(Deserialize)]
        struct ErrorResponse {
            title: String,
            #[serde(default)]
            detail: Option<String>,
        }

        let res = req.send().await?;
        let status_code = res.status();
        if status_code.is_success() {
            Ok(res.json().await?)
        } else {
            let retryable = status_code == StatusCode::REQUEST_TIMEOUT
                || status_code == StatusCode::TOO_MANY_REQUESTS
                || status_code.is_server_error();
            let res_body = res.text().await?;
            let detail = match serde_json::from_str::<ErrorResponse>(&res_body) {
                Ok(e) => match e.detail {
                    Some(detail) => format!("{} ({status_code}): {detail}", e.title),
                    None => format!("{} ({status_code})", e.title),
                },
                Err(_) => format!("undecodable aggregation error ({status_code})"),
            };
            Err(Error::integration(detail, retryable))
        }
    }

    /// Streams the buckets of a bucketed aggregation query.
    ///
    /// The underlying API call is paginated. The returned stream will fetch
    /// additional pages as it is consumed.
    pub fn stream_usage_buckets<'a>(
        &'a self,
        query: &UsageQuery,
    ) -> impl Stream<Item = Result<UsageBucket, Error>> + 'a {
        #[derive(Deserialize)]
        struct Paginated {
            data: Vec<UsageBucket>,
            pagination_metadata: PaginationMetadata,
        }

        #[derive(Deserialize)]
        struct PaginationMetadata {
            next_cursor: Option<String>,
        }

        let query = query.clone();
        try_stream! {
            let mut cursor: Option<String> = None;
            loop {
                let mut req = self.post(&self.buckets_url).json(&query);
                if let Some(cursor) = &cursor {
                    req = req.query(&[("cursor", cursor)]);
                }
                let res: Paginated = self.send_request(req).await?;
                for bucket in res.data {
                    yield bucket;
                }
                match res.pagination_metadata.next_cursor {
                    None => break,
                    Some(next_cursor) => cursor = Some(next_cursor),
                }
            }
        }
    }
}

#[async_trait]
impl UsageSource for UsageHttpClient {
    async fn get_usage(&self, query: &UsageQuery) -> Result<UsageQuantity, Error> {
        let req = self.post(&self.usage_url).json(query);
        let res = self.send_request(req).await?;
        Ok(res)
    }

    async fn get_usage_with_filters(
        &self,
        query: &UsageQuery,
        groups: &[FilterGroup],
    ) -> Result<Vec<FilteredUsage>, Error> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            #[serde(flatten)]
            query: &'a UsageQuery,
            filter_groups: &'a [FilterGroup],
        }

        #[derive(Deserialize)]
        struct Results {
            results: Vec<FilteredUsage>,
        }

        // The service attributes each event to the first matching group, so
        // groups are submitted in priority order: most specific first.
        let mut groups = groups.to_vec();
        groups.sort_by(|a, b| b.specificity().cmp(&a.specificity()));

        let req = self.post(&self.filtered_url).json(&Envelope {
            query,
            filter_groups: &groups,
        });
        let res: Results = self.send_request(req).await?;
        Ok(res.results)
    }
}
