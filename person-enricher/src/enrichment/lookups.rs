use std::time;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{AgeLookup, GenderLookup, LookupError, NationalityLookup};
use crate::types::Gender;

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("person-enricher")
        .timeout(request_timeout)
        .build()
}

/// `GET {url}?name={name}`, decoded as JSON. Anything but a 2xx is a failure.
async fn get_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
    name: &str,
) -> Result<T, LookupError> {
    let response = client.get(url).query(&[("name", name)]).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(LookupError::Status(status.as_u16()));
    }

    Ok(response.json::<T>().await?)
}

#[derive(Deserialize)]
struct AgifyResponse {
    age: Option<i32>,
}

#[derive(Deserialize)]
struct GenderizeResponse {
    gender: Option<String>,
}

#[derive(Deserialize)]
struct NationalizeResponse {
    #[serde(default)]
    country: Vec<CountryProbability>,
}

#[derive(Deserialize)]
struct CountryProbability {
    country_id: String,
    probability: f64,
}

pub struct AgifyClient {
    client: Client,
    url: String,
}

impl AgifyClient {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl AgeLookup for AgifyClient {
    async fn age(&self, name: &str) -> Result<i32, LookupError> {
        let response: AgifyResponse = get_json(&self.client, &self.url, name).await?;
        match response.age {
            Some(age) if age > 0 => Ok(age),
            _ => Err(LookupError::NoAnswer),
        }
    }
}

pub struct GenderizeClient {
    client: Client,
    url: String,
}

impl GenderizeClient {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl GenderLookup for GenderizeClient {
    async fn gender(&self, name: &str) -> Result<Gender, LookupError> {
        let response: GenderizeResponse = get_json(&self.client, &self.url, name).await?;
        match response.gender.as_deref() {
            Some("male") => Ok(Gender::Male),
            Some("female") => Ok(Gender::Female),
            _ => Err(LookupError::NoAnswer),
        }
    }
}

pub struct NationalizeClient {
    client: Client,
    url: String,
}

impl NationalizeClient {
    pub fn new(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl NationalityLookup for NationalizeClient {
    /// The most probable country wins. Candidates without a country code or
    /// with no probability at all are not answers.
    async fn nationality(&self, name: &str) -> Result<String, LookupError> {
        let response: NationalizeResponse = get_json(&self.client, &self.url, name).await?;
        response
            .country
            .into_iter()
            .filter(|c| c.probability > 0.0 && !c.country_id.is_empty())
            .max_by(|a, b| a.probability.total_cmp(&b.probability))
            .map(|c| c.country_id)
            .ok_or(LookupError::NoAnswer)
    }
}
