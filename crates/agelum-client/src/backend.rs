use crate::ClientError;
use agelum_core::wire::{
    Ack, ErrorResponse, HistoryAppend, HistoryResponse, InputRequest, LaunchRequest,
    ModelsResponse, MtimeResponse, RunRequest, RunResponse, SessionStatus, StreamKind,
    ToolAvailability, ToolsResponse, PROCESS_ID_HEADER, PROCESS_RUNNING_HEADER,
    STREAM_KIND_HEADER,
};
use agelum_core::HistoryEntry;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use url::Url;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

/// A live output body plus the correlation data that arrived with it.
pub struct OutputStream {
    pub process_id: String,
    pub kind: StreamKind,
    pub running: bool,
    pub body: ByteStream,
}

/// Execution backend operations consumed by the client side.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolAvailability>, ClientError>;

    async fn list_models(&self, tool: &str) -> Result<Vec<String>, ClientError>;

    async fn run(&self, request: &RunRequest) -> Result<RunResponse, ClientError>;

    async fn launch(&self, request: &LaunchRequest) -> Result<OutputStream, ClientError>;

    async fn send_input(&self, process_id: &str, data: &str) -> Result<(), ClientError>;

    async fn status(&self, process_id: &str) -> Result<SessionStatus, ClientError>;

    async fn resume(&self, process_id: &str, from: Option<u64>)
        -> Result<OutputStream, ClientError>;

    async fn terminate(&self, process_id: &str) -> Result<bool, ClientError>;

    async fn history(&self) -> Result<Vec<HistoryEntry>, ClientError>;

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), ClientError>;

    async fn file_mtime(&self, path: &str) -> Result<Option<i64>, ClientError>;
}

/// [`Backend`] over the hub's HTTP surface.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base: Url,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        let mut base = Url::parse(base).map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| ClientError::InvalidUrl(err.to_string()))
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let response = Self::check(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn open_stream(
        response: reqwest::Response,
        expected: StreamKind,
    ) -> Result<OutputStream, ClientError> {
        let response = Self::check(response).await?;
        let headers = response.headers();
        let process_id = header_value(headers, PROCESS_ID_HEADER)
            .ok_or(ClientError::MissingHeader(PROCESS_ID_HEADER))?;
        let kind = header_value(headers, STREAM_KIND_HEADER)
            .and_then(|value| StreamKind::parse(&value))
            .unwrap_or(expected);
        let running = header_value(headers, PROCESS_RUNNING_HEADER)
            .map(|value| value == "true")
            .unwrap_or(true);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from))
            .boxed();
        Ok(OutputStream {
            process_id,
            kind,
            running,
            body,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_tools(&self) -> Result<Vec<ToolAvailability>, ClientError> {
        let response = self.client.get(self.url("agents/tools")?).send().await?;
        Ok(Self::json::<ToolsResponse>(response).await?.tools)
    }

    async fn list_models(&self, tool: &str) -> Result<Vec<String>, ClientError> {
        let response = self
            .client
            .get(self.url("agents/models")?)
            .query(&[("tool", tool)])
            .send()
            .await?;
        Ok(Self::json::<ModelsResponse>(response).await?.models)
    }

    async fn run(&self, request: &RunRequest) -> Result<RunResponse, ClientError> {
        let response = self
            .client
            .post(self.url("agents/run")?)
            .json(request)
            .send()
            .await?;
        Self::json(response).await
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<OutputStream, ClientError> {
        let response = self
            .client
            .post(self.url("agents/launch")?)
            .json(request)
            .send()
            .await?;
        Self::open_stream(response, StreamKind::Launch).await
    }

    async fn send_input(&self, process_id: &str, data: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url("agents/input")?)
            .json(&InputRequest {
                id: process_id.to_string(),
                data: data.to_string(),
            })
            .send()
            .await?;
        Self::json::<Ack>(response).await.map(|_| ())
    }

    async fn status(&self, process_id: &str) -> Result<SessionStatus, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("agents/sessions/{process_id}/status"))?)
            .send()
            .await?;
        Self::json(response).await
    }

    async fn resume(
        &self,
        process_id: &str,
        from: Option<u64>,
    ) -> Result<OutputStream, ClientError> {
        let mut request = self
            .client
            .get(self.url(&format!("agents/sessions/{process_id}/stream"))?);
        if let Some(from) = from {
            request = request.query(&[("from", from)]);
        }
        let response = request.send().await?;
        Self::open_stream(response, StreamKind::Resume).await
    }

    async fn terminate(&self, process_id: &str) -> Result<bool, ClientError> {
        let response = self
            .client
            .delete(self.url(&format!("agents/sessions/{process_id}"))?)
            .send()
            .await?;
        Ok(Self::json::<Ack>(response).await?.success)
    }

    async fn history(&self) -> Result<Vec<HistoryEntry>, ClientError> {
        let response = self.client.get(self.url("agents/history")?).send().await?;
        Ok(Self::json::<HistoryResponse>(response).await?.history)
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url("agents/history")?)
            .json(&HistoryAppend::from(entry))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn file_mtime(&self, path: &str) -> Result<Option<i64>, ClientError> {
        let response = self
            .client
            .get(self.url("files/mtime")?)
            .query(&[("path", path)])
            .send()
            .await?;
        Ok(Self::json::<MtimeResponse>(response).await?.mtime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_under_base_path() {
        let backend = HttpBackend::new("http://127.0.0.1:4317/hub").unwrap();
        assert_eq!(
            backend.url("/agents/tools").unwrap().as_str(),
            "http://127.0.0.1:4317/hub/agents/tools"
        );
        let root = HttpBackend::new("http://127.0.0.1:4317").unwrap();
        assert_eq!(
            root.url("agents/sessions/abc/status").unwrap().as_str(),
            "http://127.0.0.1:4317/agents/sessions/abc/status"
        );
    }

    #[test]
    fn invalid_base_is_rejected() {
        assert!(matches!(
            HttpBackend::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
