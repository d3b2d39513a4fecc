//! reqwest-backed [`Transport`] talking to an analysis instance.

use async_trait::async_trait;
use owl_core::{
    ApiRequest, ApiResponse, ClientError, Method, MultipartForm, RequestBody, Result, Transport,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{multipart, Certificate, Client, Identity};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub instance_url: String,
    pub api_key: String,
    /// Scheme put in front of the key in the `Authorization` header.
    pub auth_scheme: String,
    /// PEM bundle used to verify the instance's certificate.
    pub certificate: Option<PathBuf>,
    /// PEM with a client certificate and its private key, for mutual TLS.
    pub client_cert: Option<PathBuf>,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl HttpOptions {
    pub fn new(instance_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpOptions {
            instance_url: instance_url.into(),
            api_key: api_key.into(),
            auth_scheme: "Token".to_string(),
            certificate: None,
            client_cert: None,
            timeout_ms: 30_000,
            user_agent: format!("owlctl/{}", owl_core::version()),
        }
    }
}

pub struct HttpTransport {
    client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(opts: HttpOptions) -> Result<Self> {
        let base = parse_base(&opts.instance_url)?;
        if opts.api_key.trim().is_empty() {
            return Err(ClientError::Config("no API key configured".into()));
        }

        let credentials = format!("{} {}", opts.auth_scheme, opts.api_key.trim());
        let mut auth = HeaderValue::from_str(&credentials).map_err(|_| {
            ClientError::Config("API key contains characters not allowed in a header".into())
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = Client::builder()
            .timeout(Duration::from_millis(opts.timeout_ms.max(1)))
            .user_agent(opts.user_agent.clone())
            .default_headers(headers)
            .brotli(true)
            .gzip(true)
            .deflate(true);
        if let Some(path) = &opts.certificate {
            let pem = read_pem(path)?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                ClientError::Config(format!("invalid certificate {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(path) = &opts.client_cert {
            let pem = read_pem(path)?;
            let identity = Identity::from_pem(&pem).map_err(|e| {
                ClientError::Config(format!("invalid client certificate {}: {e}", path.display()))
            })?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(HttpTransport { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Config(format!("cannot build URL for '{path}': {e}")))
    }
}

fn parse_base(raw: &str) -> Result<Url> {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return Err(ClientError::Config("no instance URL configured".into()));
    }
    // A base without a trailing slash would lose its last path segment on join.
    if !s.ends_with('/') {
        s.push('/');
    }
    let url = Url::parse(&s)
        .map_err(|e| ClientError::Config(format!("invalid instance URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClientError::Config(format!("unsupported URL scheme '{other}' in '{raw}'"))),
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(ClientError::NotFound { path: path.to_path_buf() });
    }
    std::fs::read(path)
        .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn to_form(form: MultipartForm) -> multipart::Form {
    let mut out = multipart::Form::new();
    for (name, value) in form.fields {
        out = out.text(name, value);
    }
    for f in form.files {
        out = out.part(f.field, multipart::Part::bytes(f.content).file_name(f.filename));
    }
    out
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        let ctx = request.context();
        let method = request.method;
        let url = self.url_for(&request.path)?;
        let mut rb = self.client.request(to_reqwest(method), url.clone());
        if !request.query.is_empty() {
            rb = rb.query(&request.query);
        }
        rb = match request.body {
            RequestBody::Empty => rb,
            RequestBody::Json(v) => rb.json(&v),
            RequestBody::Multipart(form) => rb.multipart(to_form(form)),
        };
        let resp = rb
            .send()
            .await
            .map_err(|e| ctx.failed(e.status().map(|s| s.as_u16()), e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ctx.failed(Some(status), format!("reading response body: {e}")))?;
        tracing::debug!(
            %method,
            %url,
            status,
            bytes = body.len(),
            operation = ctx.operation,
            "request completed"
        );
        Ok(ApiResponse::new(status, body.to_vec()))
    }
}
