//! Pool of HTTP/3 clients, one per destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use http::Request;

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::h3::client::{authority_addr, request_authority, Client};
use crate::h3::request::RequestBody;
use crate::response::Response;
use crate::transport::quic::QuicheDialer;
use crate::transport::{Dialer, QuicConfig, TlsConfig};

/// Per-request pool options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundTripOpt {
    /// Fail with [`Error::NoCachedConnection`] instead of creating a client.
    pub only_cached_conn: bool,
}

/// Routes requests to a [`Client`] per `host:port`, creating clients on
/// first use.
pub struct RoundTripper {
    tls: TlsConfig,
    quic: QuicConfig,
    opts: ClientOptions,
    dialer: Arc<dyn Dialer>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl std::fmt::Debug for RoundTripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundTripper")
            .field("clients", &self.lock().len())
            .field("opts", &self.opts)
            .finish()
    }
}

impl Default for RoundTripper {
    fn default() -> Self {
        Self::new(TlsConfig::default(), QuicConfig::default(), ClientOptions::default())
    }
}

impl RoundTripper {
    pub fn new(tls: TlsConfig, quic: QuicConfig, opts: ClientOptions) -> Self {
        Self::with_dialer(tls, quic, opts, Arc::new(QuicheDialer::new()))
    }

    pub fn with_dialer(
        tls: TlsConfig,
        quic: QuicConfig,
        opts: ClientOptions,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            tls,
            quic,
            opts,
            dialer,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn round_trip<B>(&self, req: Request<B>) -> Result<Response>
    where
        B: Into<RequestBody>,
    {
        self.round_trip_opt(req, RoundTripOpt::default()).await
    }

    pub async fn round_trip_opt<B>(&self, req: Request<B>, opt: RoundTripOpt) -> Result<Response>
    where
        B: Into<RequestBody>,
    {
        match req.uri().scheme_str() {
            Some("https") => {}
            Some(other) => {
                return Err(Error::invalid_request(format!("unsupported scheme: {}", other)))
            }
            None => return Err(Error::invalid_request("missing scheme")),
        }
        let (parts, body) = req.into_parts();
        let host = request_authority(&parts)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::invalid_request("missing host"))?;
        let authority = authority_addr(&host);

        let client = self.client(&authority, opt.only_cached_conn)?;
        client.round_trip(Request::from_parts(parts, body)).await
    }

    fn client(&self, authority: &str, only_cached: bool) -> Result<Arc<Client>> {
        let mut clients = self.lock();
        if let Some(client) = clients.get(authority) {
            return Ok(Arc::clone(client));
        }
        if only_cached {
            return Err(Error::NoCachedConnection(authority.to_string()));
        }
        let client = Arc::new(Client::with_dialer(
            authority,
            self.tls.clone(),
            self.quic.clone(),
            self.opts.clone(),
            Arc::clone(&self.dialer),
        )?);
        tracing::debug!(%authority, "created HTTP/3 client");
        clients.insert(authority.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every client and forget them.
    pub fn close(&self) {
        let clients: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close();
        }
    }
}
