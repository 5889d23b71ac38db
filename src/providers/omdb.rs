use super::{check_status, http_client, transport_error, ProviderError, DEFAULT_REQUEST_TIMEOUT};
use crate::collaborators::{MovieInfo, MovieInfoProvider};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

/// Movie metadata from the OMDb API, looked up by title.
///
/// OMDb does its own title matching, so near-miss titles resolve to the
/// closest movie.
pub struct OmdbClient {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl OmdbClient {
    pub fn new(api_key: SecretString) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(DEFAULT_REQUEST_TIMEOUT)?,
            api_key,
            base_url: "https://www.omdbapi.com".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl MovieInfoProvider for OmdbClient {
    async fn fetch(&self, title: &str) -> Result<MovieInfo, CollaboratorError> {
        debug!(title, "looking up movie");
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[("apikey", self.api_key.expose_secret()), ("t", title)])
            .send()
            .await
            .map_err(transport_error)?;
        let body: OmdbResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        body.into_movie()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OmdbResponse {
    response: String,
    error: Option<String>,
    title: Option<String>,
    plot: Option<String>,
    year: Option<String>,
    rated: Option<String>,
    runtime: Option<String>,
    genre: Option<String>,
    director: Option<String>,
    actors: Option<String>,
    poster: Option<String>,
    #[serde(rename = "imdbRating")]
    imdb_rating: Option<String>,
    metascore: Option<String>,
}

impl OmdbResponse {
    fn into_movie(self) -> Result<MovieInfo, CollaboratorError> {
        if !self.response.eq_ignore_ascii_case("true") {
            let message = self.error.unwrap_or_else(|| "Movie not found!".to_string());
            return Err(if message.contains("Invalid API key") {
                CollaboratorError::Unauthorized(message)
            } else {
                CollaboratorError::NotFound(message)
            });
        }
        Ok(MovieInfo {
            title: self.title.unwrap_or_default(),
            plot: self.plot.unwrap_or_default(),
            year: self.year,
            rated: self.rated,
            runtime: self.runtime,
            genre: self.genre,
            director: self.director,
            actors: self.actors,
            poster: self.poster,
            imdb_rating: self.imdb_rating,
            metascore: self.metascore,
        })
    }
}
