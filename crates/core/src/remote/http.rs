use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;
use url::Url;

use super::{RemoteError, RemoteInstance};
use crate::model::{RestoringChunk, RestoringPoint};

pub const CHECKSUM_HEADER: &str = "x-pointsync-checksum";

/// Remote instance reached over HTTP with bearer-token auth.
pub struct HttpRemote {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpRemote {
    /// Creates a client for the instance at `endpoint`.
    ///
    /// # Errors
    /// Returns an error if the endpoint does not parse or the HTTP client cannot be built.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        Url::parse(endpoint).context("parsing instance endpoint")?;
        let client = Client::builder()
            .user_agent("pointsync/0.1")
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            token: token.to_string(),
        })
    }

    fn route_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint).context("parsing instance endpoint")?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("endpoint must be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        self.route_url(segments)
            .map_err(|err| RemoteError::Instance(format!("{err:#}")))
    }

    fn bearer(&self) -> Result<HeaderValue, RemoteError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|err| RemoteError::Instance(format!("constructing bearer header: {err}")))?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<Response, RemoteError> {
        request
            .send()
            .await
            .map_err(|err| RemoteError::Instance(err.to_string()))
    }

    async fn read_point(response: Response) -> Result<RestoringPoint, RemoteError> {
        response
            .json::<RestoringPoint>()
            .await
            .map_err(|err| RemoteError::Instance(format!("decoding restoring point: {err}")))
    }

    fn unexpected(status: StatusCode) -> RemoteError {
        RemoteError::Instance(format!("unexpected status {status}"))
    }
}

#[async_trait]
impl RemoteInstance for HttpRemote {
    async fn get_point(
        &self,
        point_id: &str,
        force_health_refresh: bool,
    ) -> Result<RestoringPoint, RemoteError> {
        let mut url = self.url(&["points", point_id])?;
        url.query_pairs_mut()
            .append_pair("health", if force_health_refresh { "1" } else { "0" });
        debug!(%url, "fetching restoring point");
        let response = Self::send(self.client.get(url).header(AUTHORIZATION, self.bearer()?)).await?;
        match response.status() {
            StatusCode::OK => Self::read_point(response).await,
            StatusCode::NOT_FOUND => Err(RemoteError::PointNotFound(point_id.to_string())),
            status => Err(Self::unexpected(status)),
        }
    }

    async fn create_point(&self, point: &RestoringPoint) -> Result<RestoringPoint, RemoteError> {
        let url = self.url(&["points"])?;
        let response = Self::send(
            self.client
                .post(url)
                .header(AUTHORIZATION, self.bearer()?)
                .json(point),
        )
        .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Self::read_point(response).await,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(RemoteError::InvalidItem(format!("restoring point {}", point.id())))
            }
            StatusCode::NOT_FOUND => Err(RemoteError::ResourceNotFound("points".to_string())),
            status => Err(Self::unexpected(status)),
        }
    }

    async fn upload_chunk(
        &self,
        point: &RestoringPoint,
        data_name: &str,
        chunk: &RestoringChunk,
    ) -> Result<(), RemoteError> {
        let filename = chunk.filename();
        let url = self.url(&["points", point.id(), "chunks", data_name, &filename])?;
        let response = Self::send(
            self.client
                .put(url)
                .header(AUTHORIZATION, self.bearer()?)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CHECKSUM_HEADER, chunk.checksum())
                .body(chunk.content().to_vec()),
        )
        .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::NOT_FOUND => Err(RemoteError::ResourceNotFound(format!(
                "{}/{data_name}/{filename}",
                point.id()
            ))),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Err(
                RemoteError::InvalidItem(format!("chunk {data_name}/{}", chunk.name())),
            ),
            status => Err(Self::unexpected(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkBuilder, PointDraft, RestoringData, RootType};
    use httptest::matchers::{contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{all_of, Expectation, Server};

    fn point() -> (RestoringPoint, RestoringChunk) {
        let chunk = ChunkBuilder::fixed("backup_sql")
            .count(1)
            .with_content(b"-- dump".to_vec());
        let mut draft = PointDraft::with_id("20240101000000-abc", 1_704_067_200, "25.0.2", true);
        draft.add_data(RestoringData::new(RootType::SqlDump, "", RestoringData::SQL_DUMP));
        draft.add_chunks(RestoringData::SQL_DUMP, [chunk.clone().without_content()]);
        (draft.seal(), chunk)
    }

    #[test]
    fn routes_keep_endpoint_prefix() {
        let remote = HttpRemote::new("https://backup2.example/api/", "t").unwrap();
        let url = remote.route_url(&["points", "p1"]).unwrap();
        assert_eq!(url.as_str(), "https://backup2.example/api/points/p1");

        let remote = HttpRemote::new("https://backup2.example/api", "t").unwrap();
        let url = remote.route_url(&["points"]).unwrap();
        assert_eq!(url.as_str(), "https://backup2.example/api/points");
    }

    #[tokio::test]
    async fn get_point_maps_not_found() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/api/points/missing"))
                .respond_with(status_code(404)),
        );
        let remote = HttpRemote::new(&server.url_str("/api/"), "secret").unwrap();
        let err = remote.get_point("missing", false).await.unwrap_err();
        assert!(matches!(err, RemoteError::PointNotFound(_)));
    }

    #[tokio::test]
    async fn get_point_requests_health_refresh() {
        let (point, _) = point();
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/api/points/20240101000000-abc"),
                request::query(url_decoded(contains(("health", "1")))),
                request::headers(contains(("authorization", "Bearer secret"))),
            ])
            .respond_with(json_encoded(point.clone())),
        );
        let remote = HttpRemote::new(&server.url_str("/api/"), "secret").unwrap();
        let fetched = remote.get_point(point.id(), true).await.unwrap();
        assert_eq!(fetched, point);
    }

    #[tokio::test]
    async fn create_point_maps_invalid_item() {
        let (point, _) = point();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/api/points"))
                .respond_with(status_code(422)),
        );
        let remote = HttpRemote::new(&server.url_str("/api/"), "secret").unwrap();
        let err = remote.create_point(&point).await.unwrap_err();
        assert!(matches!(err, RemoteError::InvalidItem(_)));
    }

    #[tokio::test]
    async fn upload_sends_payload_and_checksum() {
        let (point, chunk) = point();
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path(
                    "PUT",
                    "/api/points/20240101000000-abc/chunks/sqldump/backup_sql"
                ),
                request::headers(contains((CHECKSUM_HEADER, chunk.checksum().to_string()))),
                request::body("-- dump"),
            ])
            .respond_with(status_code(201)),
        );
        let remote = HttpRemote::new(&server.url_str("/api/"), "secret").unwrap();
        remote
            .upload_chunk(&point, RestoringData::SQL_DUMP, &chunk)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_instance_errors() {
        let (point, chunk) = point();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method("PUT")).respond_with(status_code(500)),
        );
        let remote = HttpRemote::new(&server.url_str("/"), "secret").unwrap();
        let err = remote
            .upload_chunk(&point, RestoringData::SQL_DUMP, &chunk)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Instance(_)));
    }
}
