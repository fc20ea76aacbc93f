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

//! Tests for the usage aggregation HTTP client against a fake server.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use rust_decimal_macros::dec;
use serde_json::json;
use test_log::test;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use metered_billing::{
    Period, UsageHttpClient, UsageHttpClientConfig, UsageQuery, UsageSource,
};

fn client(server: &MockServer) -> UsageHttpClient {
    UsageHttpClient::builder()
        .max_retries(3)
        .retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .build(UsageHttpClientConfig {
            api_key: "test-key".into(),
            endpoint: format!("{}/v1", server.uri()).parse().unwrap(),
        })
}

fn query() -> UsageQuery {
    UsageQuery::new(
        "meter_calls",
        "cus_1",
        Period::new(
            Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
        )
        .unwrap(),
    )
}

#[test(tokio::test)]
async fn scalar_usage_decodes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/usage"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "meter_id": "meter_calls",
            "customer_id": "cus_1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "quantity": "42.5" })))
        .mount(&server)
        .await;

    let usage = client(&server).get_usage(&query()).await.unwrap();
    assert_eq!(usage.total(), dec!(42.5));
}

#[test(tokio::test)]
async fn bucketed_usage_decodes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "per_bucket": [
                { "bucket_start": "2023-04-01T00:00:00Z", "quantity": "9" },
                { "bucket_start": "2023-04-01T00:01:00Z", "quantity": "10" },
            ]
        })))
        .mount(&server)
        .await;

    let usage = client(&server).get_usage(&query()).await.unwrap();
    assert_eq!(usage.total(), dec!(19));
}

#[test(tokio::test)]
async fn api_errors_surface_as_integration_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/usage"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "title": "bad usage query",
            "detail": "unknown meter",
        })))
        .mount(&server)
        .await;

    let err = client(&server).get_usage(&query()).await.unwrap_err();
    assert_eq!(err.code(), "integration_failure");
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("bad usage query"));
}

#[test(tokio::test)]
async fn transient_failures_are_retried() {
    let server = MockServer::start().await;
    // Two failures, then success; the retry middleware absorbs both.
    Mock::given(method("POST"))
        .and(path("/v1/usage"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/usage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "quantity": "7" })))
        .mount(&server)
        .await;

    let usage = client(&server).get_usage(&query()).await.unwrap();
    assert_eq!(usage.total(), dec!(7));
}

#[test(tokio::test)]
async fn filtered_usage_attributes_by_price() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/usage/filtered"))
        .and(body_partial_json(json!({ "meter_id": "meter_calls" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "price_id": "price_archive", "quantity": "100" },
                { "price_id": "price_standard", "quantity": "300" },
            ]
        })))
        .mount(&server)
        .await;

    let groups = vec![
        metered_billing::FilterGroup {
            price_id: "price_standard".into(),
            filters: Default::default(),
        },
        metered_billing::FilterGroup {
            price_id: "price_archive".into(),
            filters: {
                let mut filters = std::collections::BTreeMap::new();
                filters.insert("tier".to_string(), vec!["archive".to_string()]);
                filters
            },
        },
    ];
    let results = client(&server)
        .get_usage_with_filters(&query(), &groups)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].price_id, "price_archive");
    assert_eq!(results[0].quantity.total(), dec!(100));
}

#[test(tokio::test)]
async fn bucket_streams_follow_pagination_cursors() {
    let server = MockServer::start().await;
    // The cursor-bearing page is mounted first so the cursorless first
    // request falls through to the first page.
    Mock::given(method("POST"))
        .and(path("/v1/usage/buckets"))
        .and(query_param("cursor", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ { "bucket_start": "2023-04-01T00:01:00Z", "quantity": "10" } ],
            "pagination_metadata": { "next_cursor": null }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/usage/buckets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ { "bucket_start": "2023-04-01T00:00:00Z", "quantity": "9" } ],
            "pagination_metadata": { "next_cursor": "page-2" }
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let buckets: Vec<_> = client
        .stream_usage_buckets(&query())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].quantity, dec!(9));
    assert_eq!(buckets[1].quantity, dec!(10));
}
