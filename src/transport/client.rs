use std::sync::atomic::Ordering;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::load_secret_key;
use russh::{ChannelStream, Disconnect};
use tokio::time::timeout;

use super::*;

/// Grace period for the polite disconnect before the connection is
/// abandoned anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

impl TransportClient {
    /// Dial a target directly, or through the first reachable gateway of
    /// `gateways` when the list is non-empty.
    ///
    /// With gateways, failure to reach any gateway at all is
    /// [`BrokerError::NoAvailableGateway`]; a reachable gateway that cannot
    /// reach the target is [`BrokerError::GatewayTargetUnreachable`]. The
    /// gateway transport dialed here is owned by the returned client and is
    /// torn down with it.
    pub async fn dial(
        endpoint: TargetEndpoint,
        auth: AuthCredential,
        opts: &DialOptions,
        gateways: &[Gateway],
    ) -> Result<Arc<Self>, BrokerError> {
        if gateways.is_empty() {
            let handle = Self::connect_direct(&endpoint, &auth, opts).await?;
            return Ok(Arc::new(Self::assemble(handle, endpoint, &auth, None, false)));
        }

        let gateway = Self::dial_first_gateway(gateways, opts).await?;
        Self::dial_tunneled(gateway, endpoint, auth, opts, true).await
    }

    /// Dial a target through an already-connected gateway supplied by the
    /// caller. The gateway stays caller-owned and is not closed with the
    /// returned client.
    pub async fn dial_via(
        gateway: Arc<TransportClient>,
        endpoint: TargetEndpoint,
        auth: AuthCredential,
        opts: &DialOptions,
    ) -> Result<Arc<Self>, BrokerError> {
        Self::dial_tunneled(gateway, endpoint, auth, opts, false).await
    }

    async fn dial_first_gateway(
        gateways: &[Gateway],
        opts: &DialOptions,
    ) -> Result<Arc<Self>, BrokerError> {
        for gateway in gateways {
            match Self::connect_direct(&gateway.endpoint, &gateway.auth, opts).await {
                Ok(handle) => {
                    debug!("gateway {} answered", gateway.endpoint.identity());
                    return Ok(Arc::new(Self::assemble(
                        handle,
                        gateway.endpoint.clone(),
                        &gateway.auth,
                        None,
                        false,
                    )));
                }
                Err(e) => {
                    debug!("gateway {} unusable: {}", gateway.endpoint.identity(), e);
                }
            }
        }
        Err(BrokerError::NoAvailableGateway)
    }

    async fn dial_tunneled(
        gateway: Arc<TransportClient>,
        endpoint: TargetEndpoint,
        auth: AuthCredential,
        opts: &DialOptions,
        owns_gateway: bool,
    ) -> Result<Arc<Self>, BrokerError> {
        let unreachable = |reason: String| BrokerError::GatewayTargetUnreachable {
            gateway: gateway.identity().to_string(),
            reason,
        };

        let stream = gateway
            .open_tunnel(&endpoint.host, endpoint.port)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let handler = ClientHandler::new(endpoint.identity(), opts.verification.clone());
        let config = Self::ssh_config(opts);
        let mut handle = timeout(opts.timeout, client::connect_stream(config, stream, handler))
            .await
            .map_err(|_| BrokerError::DialTimeout(opts.timeout.as_secs()))?
            .map_err(|e| unreachable(e.to_string()))?;

        Self::authenticate(&mut handle, &endpoint, &auth).await?;
        debug!(
            "connected to {} via {}",
            endpoint.identity(),
            gateway.identity()
        );
        Ok(Arc::new(Self::assemble(
            handle,
            endpoint,
            &auth,
            Some(gateway),
            owns_gateway,
        )))
    }

    async fn connect_direct(
        endpoint: &TargetEndpoint,
        auth: &AuthCredential,
        opts: &DialOptions,
    ) -> Result<Handle<ClientHandler>, BrokerError> {
        let handler = ClientHandler::new(endpoint.identity(), opts.verification.clone());
        let config = Self::ssh_config(opts);
        let addr = endpoint.addr();
        let mut handle = timeout(opts.timeout, client::connect(config, &addr, handler))
            .await
            .map_err(|_| BrokerError::DialTimeout(opts.timeout.as_secs()))?
            .map_err(|e| BrokerError::HandshakeFailed(e.to_string()))?;

        Self::authenticate(&mut handle, endpoint, auth).await?;
        debug!("connected to {}", endpoint.identity());
        Ok(handle)
    }

    fn ssh_config(opts: &DialOptions) -> Arc<client::Config> {
        Arc::new(client::Config {
            preferred: opts.profile.preferred(),
            keepalive_interval: Some(config::TRANSPORT_KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    async fn authenticate(
        handle: &mut Handle<ClientHandler>,
        endpoint: &TargetEndpoint,
        auth: &AuthCredential,
    ) -> Result<(), BrokerError> {
        let rejected = || BrokerError::AuthenticationRejected {
            user: endpoint.username.clone(),
            host: endpoint.host.clone(),
        };
        match auth {
            AuthCredential::Password(password) => {
                let result = handle
                    .authenticate_password(&endpoint.username, password)
                    .await?;
                if !result.success() {
                    return Err(rejected());
                }
            }
            AuthCredential::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| BrokerError::HandshakeFailed(e.to_string()))?;
                let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
                let result = handle
                    .authenticate_publickey(
                        &endpoint.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await?;
                if !result.success() {
                    return Err(rejected());
                }
            }
        }
        Ok(())
    }

    fn assemble(
        handle: Handle<ClientHandler>,
        endpoint: TargetEndpoint,
        auth: &AuthCredential,
        gateway: Option<Arc<TransportClient>>,
        owns_gateway: bool,
    ) -> Self {
        let identity = endpoint.identity();
        Self {
            backend: Backend::Ssh(handle),
            endpoint,
            identity,
            auth_fingerprint: auth.fingerprint(),
            counts: Arc::new(RefCounts::default()),
            gateway,
            owns_gateway,
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &TargetEndpoint {
        &self.endpoint
    }

    /// Sessions currently open on this transport.
    pub fn ref_count(&self) -> u32 {
        self.counts.external()
    }

    /// Holds the pool itself has placed on this transport.
    pub fn self_ref_count(&self) -> u32 {
        self.counts.self_refs()
    }

    pub(crate) fn acquire_self(&self) {
        self.counts.acquire_self();
    }

    pub(crate) fn release_self(&self) {
        self.counts.release_self();
    }

    /// Whether pooled reuse with `auth` would land in the same account with
    /// the same credential material. Compares fingerprints only.
    pub fn credentials_match(&self, username: &str, auth: &AuthCredential) -> bool {
        self.endpoint.username == username && self.auth_fingerprint == auth.fingerprint()
    }

    pub fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match &self.backend {
            Backend::Ssh(handle) => !handle.is_closed(),
            #[cfg(test)]
            Backend::Stub => true,
        }
    }

    /// Open an interactive session: one channel with a pty and a shell.
    /// Increments the external ref count; the count drops again when the
    /// returned [`Session`] is closed or dropped.
    pub async fn open_session(&self, term: &TerminalOptions) -> Result<Session, BrokerError> {
        match &self.backend {
            Backend::Ssh(handle) => {
                let channel = handle.channel_open_session().await?;
                channel
                    .request_pty(false, &term.term_type, term.cols, term.rows, 0, 0, &[])
                    .await?;
                channel.request_shell(false).await?;
                self.counts.acquire_external();
                trace!("session opened on {}", self.identity);
                Ok(Session::new(channel, self.counts.clone(), true))
            }
            #[cfg(test)]
            Backend::Stub => {
                self.counts.acquire_external();
                Ok(Session::stub(self.counts.clone()))
            }
        }
    }

    /// Open a raw forwarded stream to `host:port` on the far side. Used
    /// both for gateway chaining and by adapters that bridge plain TCP.
    pub async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ChannelStream<Msg>, BrokerError> {
        match &self.backend {
            Backend::Ssh(handle) => {
                let channel = handle
                    .channel_open_direct_tcpip(host, port.into(), "127.0.0.1", 0)
                    .await?;
                Ok(channel.into_stream())
            }
            #[cfg(test)]
            Backend::Stub => Err(BrokerError::ConnectionClosed),
        }
    }

    /// Open a named subsystem (for example `sftp`) as a raw stream.
    pub async fn open_subsystem(&self, name: &str) -> Result<ChannelStream<Msg>, BrokerError> {
        match &self.backend {
            Backend::Ssh(handle) => {
                let channel = handle.channel_open_session().await?;
                channel.request_subsystem(true, name).await?;
                Ok(channel.into_stream())
            }
            #[cfg(test)]
            Backend::Stub => Err(BrokerError::ConnectionClosed),
        }
    }

    /// Close the transport. Idempotent; already-open sessions see EOF. A
    /// privately-owned gateway transport is closed afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            Backend::Ssh(handle) => {
                match timeout(
                    CLOSE_GRACE,
                    handle.disconnect(Disconnect::ByApplication, "", "en"),
                )
                .await
                {
                    Ok(Ok(())) => debug!("disconnected {}", self.identity),
                    Ok(Err(e)) => debug!("disconnect error on {}: {}", self.identity, e),
                    Err(_) => debug!("disconnect timed out on {}", self.identity),
                }
            }
            #[cfg(test)]
            Backend::Stub => {}
        }
        if self.owns_gateway {
            if let Some(gateway) = &self.gateway {
                Box::pin(gateway.close()).await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(endpoint: TargetEndpoint, auth: &AuthCredential) -> Arc<Self> {
        let identity = endpoint.identity();
        Arc::new(Self {
            backend: Backend::Stub,
            endpoint,
            identity,
            auth_fingerprint: auth.fingerprint(),
            counts: Arc::new(RefCounts::default()),
            gateway: None,
            owns_gateway: false,
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_client() -> Arc<TransportClient> {
        TransportClient::stub(
            TargetEndpoint::new("192.0.2.10", 22, "ops"),
            &AuthCredential::Password("hunter2".into()),
        )
    }

    #[tokio::test]
    async fn session_lifecycle_drives_ref_count() {
        let client = stub_client();
        assert_eq!(client.ref_count(), 0);

        let term = TerminalOptions::default();
        let first = client.open_session(&term).await.unwrap();
        let second = client.open_session(&term).await.unwrap();
        assert_eq!(client.ref_count(), 2);

        drop(first);
        assert_eq!(client.ref_count(), 1);
        drop(second);
        assert_eq!(client.ref_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_marks_disconnected() {
        let client = stub_client();
        assert!(client.is_connected());
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }

    #[test]
    fn credentials_match_compares_user_and_material() {
        let client = stub_client();
        assert!(client.credentials_match("ops", &AuthCredential::Password("hunter2".into())));
        assert!(!client.credentials_match("ops", &AuthCredential::Password("wrong".into())));
        assert!(!client.credentials_match("root", &AuthCredential::Password("hunter2".into())));
    }
}
