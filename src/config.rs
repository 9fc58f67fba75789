use std::time::Duration;

use crate::Error;

/// Shortest handshake timeout a session accepts.
pub const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(8000);

/// Longest handshake timeout a session accepts.
pub const MAX_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(60000);

/// Stack configuration.
///
/// Shared between the sessions, the server and the commissioner via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    mtu: usize,
    max_packet_size: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    session_timeout: Duration,
    cookie_lifetime: Duration,
    session_cache_capacity: usize,
    coap_response_timeout: Duration,
    coap_max_retransmit: usize,
    coap_exchange_lifetime: Duration,
    petition_max_retry: usize,
    petition_retry_delay: Duration,
    keep_alive_interval: Duration,
    joiner_port: u16,
    commissioner_id: String,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            mtu: 1280,
            max_packet_size: 1500,
            max_queue_rx: 30,
            max_queue_tx: 10,
            flight_start_rto: Duration::from_secs(1),
            flight_retries: 4,
            handshake_timeout: MAX_HANDSHAKE_TIMEOUT,
            session_timeout: Duration::from_secs(60),
            cookie_lifetime: Duration::from_secs(60),
            session_cache_capacity: 0,
            coap_response_timeout: Duration::from_secs(10),
            coap_max_retransmit: 2,
            coap_exchange_lifetime: Duration::from_secs(247),
            petition_max_retry: 2,
            petition_retry_delay: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(15),
            joiner_port: 49192,
            commissioner_id: "OpenThread".to_string(),
            rng_seed: None,
        }
    }

    /// Max transmission unit.
    ///
    /// The largest DTLS datagram we will produce. Handshake messages
    /// are fragmented to stay within it.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest datagram we read from a socket.
    #[inline(always)]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Max amount of incoming packets to buffer before rejecting more input.
    #[inline(always)]
    pub fn max_queue_rx(&self) -> usize {
        self.max_queue_rx
    }

    /// Max amount of outgoing packets to buffer.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }

    /// Time of first flight retransmission.
    ///
    /// Every flight restarts with this value. Doubled for every retry.
    #[inline(always)]
    pub fn flight_start_rto(&self) -> Duration {
        self.flight_start_rto
    }

    /// Max number of retries per flight.
    #[inline(always)]
    pub fn flight_retries(&self) -> usize {
        self.flight_retries
    }

    /// Timeout for the entire handshake, regardless of flights.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// How far into the future each `process()` pushes a session's expiration.
    #[inline(always)]
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// How long a cookie secret is used before it is rotated.
    ///
    /// Cookies minted with the previous secret are still accepted.
    #[inline(always)]
    pub fn cookie_lifetime(&self) -> Duration {
        self.cookie_lifetime
    }

    /// Number of sessions remembered for resumption. Zero disables it.
    #[inline(always)]
    pub fn session_cache_capacity(&self) -> usize {
        self.session_cache_capacity
    }

    /// Wait for a response to a confirmable CoAP request.
    #[inline(always)]
    pub fn coap_response_timeout(&self) -> Duration {
        self.coap_response_timeout
    }

    /// Retransmissions of a confirmable CoAP request before giving up.
    #[inline(always)]
    pub fn coap_max_retransmit(&self) -> usize {
        self.coap_max_retransmit
    }

    /// How long an acknowledged request waits for its separate response
    /// (`EXCHANGE_LIFETIME`, RFC 7252 4.8.2).
    #[inline(always)]
    pub fn coap_exchange_lifetime(&self) -> Duration {
        self.coap_exchange_lifetime
    }

    /// Petition retries after a rejection.
    #[inline(always)]
    pub fn petition_max_retry(&self) -> usize {
        self.petition_max_retry
    }

    /// Delay before a petition is retried.
    #[inline(always)]
    pub fn petition_retry_delay(&self) -> Duration {
        self.petition_retry_delay
    }

    /// Interval between keep-alives. `Duration::ZERO` disables them.
    #[inline(always)]
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    /// Port the joiner session listens on.
    #[inline(always)]
    pub fn joiner_port(&self) -> u16 {
        self.joiner_port
    }

    /// Commissioner id sent in the petition.
    #[inline(always)]
    pub fn commissioner_id(&self) -> &str {
        &self.commissioner_id
    }

    /// Seed for deterministic randomness.
    ///
    /// Only meant for tests. `None` draws from the OS.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().into_config()
    }
}

/// Builder for [`Config`].
#[derive(Debug)]
pub struct ConfigBuilder {
    mtu: usize,
    max_packet_size: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    session_timeout: Duration,
    cookie_lifetime: Duration,
    session_cache_capacity: usize,
    coap_response_timeout: Duration,
    coap_max_retransmit: usize,
    coap_exchange_lifetime: Duration,
    petition_max_retry: usize,
    petition_retry_delay: Duration,
    keep_alive_interval: Duration,
    joiner_port: u16,
    commissioner_id: String,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the max transmission unit (MTU).
    ///
    /// Defaults to 1280.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Largest datagram read from a socket.
    ///
    /// Defaults to 1500.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Defaults to 30.
    pub fn max_queue_rx(mut self, max_queue_rx: usize) -> Self {
        self.max_queue_rx = max_queue_rx;
        self
    }

    /// Defaults to 10.
    pub fn max_queue_tx(mut self, max_queue_tx: usize) -> Self {
        self.max_queue_tx = max_queue_tx;
        self
    }

    /// Set the time of the first flight retry.
    ///
    /// Defaults to 1 second.
    pub fn flight_start_rto(mut self, rto: Duration) -> Self {
        self.flight_start_rto = rto;
        self
    }

    /// Defaults to 4.
    pub fn flight_retries(mut self, retries: usize) -> Self {
        self.flight_retries = retries;
        self
    }

    /// Set the overall handshake timeout.
    ///
    /// Must be within 8 to 60 seconds. Defaults to 60 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Defaults to 60 seconds.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Defaults to 60 seconds.
    pub fn cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    /// Enable session resumption by giving the cache a capacity.
    ///
    /// Defaults to 0 (disabled).
    pub fn session_cache_capacity(mut self, capacity: usize) -> Self {
        self.session_cache_capacity = capacity;
        self
    }

    /// Defaults to 10 seconds.
    pub fn coap_response_timeout(mut self, timeout: Duration) -> Self {
        self.coap_response_timeout = timeout;
        self
    }

    /// Defaults to 2.
    pub fn coap_max_retransmit(mut self, retries: usize) -> Self {
        self.coap_max_retransmit = retries;
        self
    }

    /// Defaults to 247 seconds.
    pub fn coap_exchange_lifetime(mut self, lifetime: Duration) -> Self {
        self.coap_exchange_lifetime = lifetime;
        self
    }

    /// Defaults to 2.
    pub fn petition_max_retry(mut self, retries: usize) -> Self {
        self.petition_max_retry = retries;
        self
    }

    /// Defaults to 5 seconds.
    pub fn petition_retry_delay(mut self, delay: Duration) -> Self {
        self.petition_retry_delay = delay;
        self
    }

    /// Set the keep-alive cadence. Zero disables keep-alives.
    ///
    /// Defaults to 15 seconds.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Defaults to 49192.
    pub fn joiner_port(mut self, port: u16) -> Self {
        self.joiner_port = port;
        self
    }

    /// Defaults to "OpenThread".
    pub fn commissioner_id(mut self, id: impl Into<String>) -> Self {
        self.commissioner_id = id.into();
        self
    }

    /// Make all randomness deterministic. Only for tests.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        if !(MIN_HANDSHAKE_TIMEOUT..=MAX_HANDSHAKE_TIMEOUT).contains(&self.handshake_timeout) {
            return Err(Error::InvalidArgument(format!(
                "handshake timeout {:?} outside {:?}..={:?}",
                self.handshake_timeout, MIN_HANDSHAKE_TIMEOUT, MAX_HANDSHAKE_TIMEOUT
            )));
        }
        if self.mtu < 256 || self.mtu > self.max_packet_size {
            return Err(Error::InvalidArgument(format!(
                "mtu {} must be within 256..={}",
                self.mtu, self.max_packet_size
            )));
        }
        let id_len = self.commissioner_id.len();
        if id_len == 0 || id_len > 64 {
            return Err(Error::InvalidArgument(format!(
                "commissioner id length {} must be within 1..=64",
                id_len
            )));
        }

        Ok(self.into_config())
    }

    fn into_config(self) -> Config {
        Config {
            mtu: self.mtu,
            max_packet_size: self.max_packet_size,
            max_queue_rx: self.max_queue_rx,
            max_queue_tx: self.max_queue_tx,
            flight_start_rto: self.flight_start_rto,
            flight_retries: self.flight_retries,
            handshake_timeout: self.handshake_timeout,
            session_timeout: self.session_timeout,
            cookie_lifetime: self.cookie_lifetime,
            session_cache_capacity: self.session_cache_capacity,
            coap_response_timeout: self.coap_response_timeout,
            coap_max_retransmit: self.coap_max_retransmit,
            coap_exchange_lifetime: self.coap_exchange_lifetime,
            petition_max_retry: self.petition_max_retry,
            petition_retry_delay: self.petition_retry_delay,
            keep_alive_interval: self.keep_alive_interval,
            joiner_port: self.joiner_port,
            commissioner_id: self.commissioner_id,
            rng_seed: self.rng_seed,
        }
    }
}
