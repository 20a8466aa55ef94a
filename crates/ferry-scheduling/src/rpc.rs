use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};

use crate::error::{SchedulingError, SchedulingResult};
use crate::proto::frontend::FrontendForQuerierClient;
use crate::tenant::ORG_ID_HEADER;

/// Maximum message size for gRPC clients.
/// The value matches the largest response body a querier is allowed to send.
pub const CLIENT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// The `host:port` address, optionally with a URL scheme.
    pub address: String,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: None,
            request_timeout: None,
        }
    }

    pub fn to_url_string(&self) -> String {
        endpoint_url(&self.address)
    }

    pub fn endpoint(&self) -> SchedulingResult<Endpoint> {
        let mut endpoint = Endpoint::from_shared(self.to_url_string())?;
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        Ok(endpoint)
    }
}

/// Adds the `http://` scheme to an address without one.
pub fn endpoint_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[tonic::async_trait]
pub trait ClientBuilder: Sized {
    async fn connect(options: &ClientOptions) -> SchedulingResult<Self>;
}

#[tonic::async_trait]
impl ClientBuilder for FrontendForQuerierClient<Channel> {
    async fn connect(options: &ClientOptions) -> SchedulingResult<Self> {
        let channel = options.endpoint()?.connect().await?;
        Ok(Self::new(channel)
            .max_decoding_message_size(CLIENT_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(CLIENT_MAX_MESSAGE_SIZE))
    }
}

/// Wraps the message in a request that carries the tenant ID in its metadata.
pub fn request_with_org_id<T>(message: T, tenant_id: &str) -> SchedulingResult<tonic::Request<T>> {
    let value = MetadataValue::<Ascii>::try_from(tenant_id)
        .map_err(|e| SchedulingError::invalid(format!("tenant ID '{tenant_id}': {e}")))?;
    let mut request = tonic::Request::new(message);
    request.metadata_mut().insert(ORG_ID_HEADER, value);
    Ok(request)
}

/// A handle to a gRPC client to support connection reuse.
/// The handle can be cheaply cloned and the underlying connection is shared.
#[derive(Debug, Clone)]
pub struct ClientHandle<T> {
    options: Arc<ClientOptions>,
    /// This must be `Arc<OnceCell<T>>` so that clones of an uninitialized handle
    /// share the same connection once it is established.
    inner: Arc<OnceCell<T>>,
}

impl<T: ClientBuilder + Clone> ClientHandle<T> {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options: Arc::new(options),
            inner: Arc::new(OnceCell::new()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Returns a clone of the RPC client, connecting on first use.
    pub async fn get(&self) -> SchedulingResult<T> {
        let options = Arc::clone(&self.options);
        self.inner
            .get_or_try_init(|| T::connect(&options))
            .await
            .cloned()
    }
}
