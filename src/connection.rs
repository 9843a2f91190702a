//! Connection to an HBase Thrift gateway.

use std::{
    borrow::Cow,
    fmt,
    io::{self, BufRead, BufReader, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, debug_span, trace};

use crate::errors::ConnectionError;

/// Connection parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Host name or address of the Thrift gateway.
    #[serde(default = "ConnectionConfig::default_host")]
    pub host: String,
    /// TCP port of the Thrift gateway.
    #[serde(default = "ConnectionConfig::default_port")]
    pub port: u16,
    /// Socket read and write timeout.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub timeout: Option<Duration>,
    /// TCP connect timeout.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub connect_timeout: Option<Duration>,
    /// Open the transport right when the connection is created.
    ///
    /// Otherwise it is opened on first use.
    #[serde(default = "crate::util::default_true")]
    pub autoconnect: bool,
    /// Prefix prepended to all table names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_prefix: Option<String>,
    /// Separator placed between table prefix and table name.
    #[serde(default = "ConnectionConfig::default_table_prefix_separator")]
    pub table_prefix_separator: String,
    /// TCP socket options.
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            timeout: None,
            connect_timeout: None,
            autoconnect: true,
            table_prefix: None,
            table_prefix_separator: Self::default_table_prefix_separator(),
            tcp: TcpConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Default value for [`Self::host`].
    #[must_use]
    #[inline]
    fn default_host() -> String {
        String::from("localhost")
    }

    /// Default value for [`Self::port`].
    #[must_use]
    #[inline]
    fn default_port() -> u16 {
        9090
    }

    /// Default value for [`Self::table_prefix_separator`].
    #[must_use]
    #[inline]
    fn default_table_prefix_separator() -> String {
        String::from("_")
    }

    /// Create configuration for connecting to a specific gateway, with default settings.
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Set prefix for all table names.
    pub fn with_table_prefix(&mut self, prefix: impl ToString) -> &mut Self {
        self.table_prefix = Some(prefix.to_string());
        self
    }

    /// Set separator placed between table prefix and table name.
    pub fn with_table_prefix_separator(&mut self, separator: impl ToString) -> &mut Self {
        self.table_prefix_separator = separator.to_string();
        self
    }

    /// Set socket read and write timeout.
    pub fn with_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set TCP connect timeout.
    pub fn with_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Choose whether the transport is opened on creation or on first use.
    pub fn with_autoconnect(&mut self, autoconnect: bool) -> &mut Self {
        self.autoconnect = autoconnect;
        self
    }

    /// Check configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidConfig`] on empty host name, zero port, zero timeouts or
    /// empty table prefix.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::invalid_config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(ConnectionError::invalid_config("port must not be zero"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConnectionError::invalid_config("timeout must not be zero"));
        }
        if self.connect_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConnectionError::invalid_config(
                "connect timeout must not be zero",
            ));
        }
        if self.table_prefix.as_deref().is_some_and(str::is_empty) {
            return Err(ConnectionError::invalid_config(
                "table prefix must not be empty",
            ));
        }
        Ok(())
    }

    /// Construct a table name by optionally adding a table name prefix.
    #[must_use]
    pub fn table_name<'n>(&self, name: &'n str) -> Cow<'n, str> {
        match &self.table_prefix {
            Some(prefix) => {
                Cow::Owned(format!("{prefix}{}{name}", self.table_prefix_separator))
            }
            None => Cow::Borrowed(name),
        }
    }
}

/// TCP socket options.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TcpConfig {
    /// Set `TCP_NODELAY` socket option.
    #[serde(default = "crate::util::default_true")]
    pub nodelay: bool,
    /// TCP keepalive socket options.
    #[serde(default)]
    pub keepalive: TcpKeepaliveConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: TcpKeepaliveConfig::default(),
        }
    }
}

/// TCP keepalive configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TcpKeepaliveConfig {
    /// Duration to remain idle before sending TCP keepalive probes. TCP keepalive is disabled if
    /// value is not provided.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub idle: Option<Duration>,
    /// Duration between two successive TCP keepalive retransmissions, if acknowledgement
    /// to the previous keepalive transmission is not received.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub interval: Option<Duration>,
}

/// Buffered transport stream, handed to RPC code by [`Connection::call`].
pub struct Stream {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl Stream {
    fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let _span = debug_span!("connect", host = %config.host, port = config.port).entered();
        let addrs = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|source| ConnectionError::Resolve {
                host: config.host.clone(),
                source,
            })?;
        let mut last_err = None;
        for addr in addrs {
            let res = match config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match res {
                Ok(stream) => return Self::configure(stream, addr, config),
                Err(source) => {
                    trace!(%addr, error = %source, "connection attempt failed");
                    last_err = Some(ConnectionError::Connect { addr, source });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ConnectionError::NoAddresses(config.host.clone())))
    }

    fn configure(
        stream: TcpStream,
        peer: SocketAddr,
        config: &ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        stream.set_read_timeout(config.timeout)?;
        stream.set_write_timeout(config.timeout)?;
        stream.set_nodelay(config.tcp.nodelay)?;
        if let Some(idle) = config.tcp.keepalive.idle {
            let keepalive = keepalive_interval(
                TcpKeepalive::new().with_time(idle),
                config.tcp.keepalive.interval,
            );
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }
        debug!(%peer, "transport opened");
        Ok(Self {
            reader: BufReader::new(stream),
            peer,
        })
    }

    /// Remote address of the gateway.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the socket.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the socket address could not be queried.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.reader.get_ref().local_addr()
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.reader.get_ref().shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for Stream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt);
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reader.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.reader.get_mut().flush()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keepalive_interval(keepalive: TcpKeepalive, interval: Option<Duration>) -> TcpKeepalive {
    match interval {
        Some(interval) => keepalive.with_interval(interval),
        None => keepalive,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn keepalive_interval(keepalive: TcpKeepalive, _interval: Option<Duration>) -> TcpKeepalive {
    keepalive
}

/// Connection to an HBase Thrift gateway.
///
/// The transport is opened on creation if [`ConnectionConfig::autoconnect`] is set, and on first
/// use otherwise. A transport which failed with a fatal error is dropped, and reopened by the
/// next [`Connection::call`].
pub struct Connection {
    config: Arc<ConnectionConfig>,
    stream: Mutex<Option<Stream>>,
}

impl Connection {
    /// Create a new connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if configuration is invalid, or if autoconnect is enabled and the transport
    /// could not be opened.
    pub fn new(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        config.validate()?;
        Self::with_shared_config(Arc::new(config))
    }

    /// Create a new connection with already validated configuration.
    pub(crate) fn with_shared_config(
        config: Arc<ConnectionConfig>,
    ) -> Result<Self, ConnectionError> {
        let conn = Self {
            config,
            stream: Mutex::new(None),
        };
        if conn.config.autoconnect {
            conn.open()?;
        }
        Ok(conn)
    }

    /// Connection parameters.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open the underlying transport. Does nothing if it is already open.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the gateway could not be reached.
    pub fn open(&self) -> Result<(), ConnectionError> {
        let mut stream = self.stream.lock();
        if stream.is_none() {
            *stream = Some(Stream::connect(&self.config)?);
        }
        Ok(())
    }

    /// Close the underlying transport. Does nothing if it is already closed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if socket shutdown failed. The transport is discarded anyway.
    pub fn close(&self) -> Result<(), ConnectionError> {
        let Some(stream) = self.stream.lock().take() else {
            return Ok(());
        };
        debug!(peer = %stream.peer, "closing transport");
        stream.shutdown().map_err(Into::into)
    }

    /// Whether the underlying transport is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Local address of the underlying socket, if the transport is open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream
            .lock()
            .as_ref()
            .and_then(|stream| stream.local_addr().ok())
    }

    /// Construct a table name by optionally adding the configured table name prefix.
    #[must_use]
    pub fn table_name<'n>(&self, name: &'n str) -> Cow<'n, str> {
        self.config.table_name(name)
    }

    /// Run RPC code against the transport, opening it first if needed.
    ///
    /// Calls on the same connection are serialized. If the closure fails with a fatal error, the
    /// transport is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the transport could not be opened, or whatever the closure returned.
    pub fn call<T, F>(&self, f: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(&mut Stream) -> Result<T, ConnectionError>,
    {
        let mut guard = self.stream.lock();
        if guard.is_none() {
            *guard = Some(Stream::connect(&self.config)?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        let result = f(stream);
        if let Err(err) = &result {
            if err.is_fatal() {
                debug!(error = %err, "dropping broken transport");
                if let Some(stream) = guard.take() {
                    if let Err(err) = stream.shutdown() {
                        debug!(error = %err, "transport shutdown failed");
                    }
                }
            }
        }
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("open", &self.is_open())
            .finish()
    }
}
