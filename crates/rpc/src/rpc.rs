use hyper::{http::HeaderValue, Body, Method, Request, Response};
use jsonrpsee::{
    server::{ServerBuilder, ServerHandle},
    Methods,
};
use std::{
    collections::HashSet,
    error::Error,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service, ServiceBuilder};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::trace;

/// Wrapper around the `jsonrpsee` server builder: HTTP transport, CORS,
/// and chain forwarding for methods not registered locally.
pub struct JsonRpcServer {
    /// HTTP address to listen on.
    addr: IpAddr,
    /// HTTP port to listen on.
    port: u16,
    /// The RPC methods to be exposed.
    methods: Methods,
    /// The [cors layer](CorsLayer) to filter requests.
    cors_layer: Option<CorsLayer>,
    /// Chain RPC endpoint unknown methods are forwarded to.
    proxy_address: Option<String>,
}

impl JsonRpcServer {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port, methods: Methods::new(), cors_layer: None, proxy_address: None }
    }

    /// Add a CORS layer; `*` allows any origin.
    pub fn with_cors(mut self, cors_domain: &[String]) -> Self {
        let cors_layer = if cors_domain.iter().any(|d| d == "*") {
            CorsLayer::new().allow_headers(Any).allow_methods([Method::POST]).allow_origin(Any)
        } else {
            let mut origins: Vec<HeaderValue> = vec![];

            for domain in cors_domain.iter() {
                if let Ok(origin) = domain.parse::<HeaderValue>() {
                    origins.push(origin);
                }
            }

            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::POST])
                .allow_origin(AllowOrigin::list(origins))
        };

        self.cors_layer = Some(cors_layer);
        self
    }

    /// Forward methods this server does not implement to the chain RPC.
    pub fn with_proxy(mut self, eth_client_address: impl Into<String>) -> Self {
        self.proxy_address = Some(eth_client_address.into());
        self
    }

    pub fn add_methods(&mut self, methods: impl Into<Methods>) -> eyre::Result<()> {
        self.methods.merge(methods.into()).map_err(Into::into)
    }

    pub async fn start(&self) -> eyre::Result<ServerHandle> {
        // The forwarding layer dispatches on the set of methods that ended
        // up registered, so it is built only once they all merged.
        let proxy_layer = self
            .proxy_address
            .as_ref()
            .map(|address| ChainProxyLayer::new(address, self.methods.method_names()));

        let service =
            ServiceBuilder::new().option_layer(self.cors_layer.clone()).option_layer(proxy_layer);

        let server = ServerBuilder::new()
            .http_only()
            .set_http_middleware(service)
            .build(SocketAddr::new(self.addr, self.port))
            .await?;

        Ok(server.start(self.methods.clone()))
    }
}

/// Routes requests by method name before they reach the local server:
/// single calls whose method is not registered here are posted to the
/// chain RPC endpoint and answered verbatim. This is what serves
/// `eth_call`, `eth_blockNumber`, `eth_estimateGas`, and the other plain
/// chain methods without per-method code.
#[derive(Clone, Debug)]
struct ChainProxyLayer {
    address: Arc<str>,
    local_methods: Arc<HashSet<Box<str>>>,
}

impl ChainProxyLayer {
    fn new<'a>(address: &str, local_methods: impl Iterator<Item = &'a str>) -> Self {
        Self {
            address: Arc::from(address),
            local_methods: Arc::new(local_methods.map(Box::from).collect()),
        }
    }
}

impl<S> Layer<S> for ChainProxyLayer {
    type Service = ChainProxy<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ChainProxy {
            inner,
            address: self.address.clone(),
            local_methods: self.local_methods.clone(),
        }
    }
}

#[derive(Clone, Debug)]
struct ChainProxy<S> {
    inner: S,
    address: Arc<str>,
    local_methods: Arc<HashSet<Box<str>>>,
}

/// Just enough of a JSON-RPC request to route it.
#[derive(serde::Deserialize)]
struct MethodCall {
    method: String,
}

impl<S> Service<Request<Body>> for ChainProxy<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<Box<dyn Error + Send + Sync>> + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = Box<dyn Error + Send + Sync + 'static>;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let address = self.address.clone();
        let local_methods = self.local_methods.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let bytes = hyper::body::to_bytes(body).await?;

            // Only single calls are routed by method name; batches and
            // anything unparseable stay with the local server, which
            // answers per the protocol.
            let forward = serde_json::from_slice::<MethodCall>(&bytes)
                .map(|call| !local_methods.contains(call.method.as_str()))
                .unwrap_or(false);

            if forward {
                trace!(target: "rpc", "forwarding request to the chain");

                let proxied = Request::post(address.as_ref())
                    .header(hyper::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))?;
                let response = hyper::Client::new().request(proxied).await?;
                return Ok(response);
            }

            inner.call(Request::from_parts(parts, Body::from(bytes))).await.map_err(Into::into)
        })
    }
}
