//! Shared HTTP client for outbound storefront calls

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;

static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_max_idle_per_host(50)
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// POST a JSON body with extra request headers
pub async fn post_json_with_headers<T: Serialize>(
    url: &str,
    headers: &[(&str, &str)],
    payload: &T,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut request = CLIENT.post(url).json(payload);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    request.send().await
}
